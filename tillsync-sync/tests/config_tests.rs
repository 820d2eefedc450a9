use pretty_assertions::assert_eq;
use std::io::Write;
use std::time::Duration;
use tillsync_sync::{SyncConfig, SyncError};
use tillsync_types::{ConflictPolicy, EntityClass};

#[test]
fn defaults_are_valid() {
    let config = SyncConfig::default();
    config.validate().unwrap();
    assert_eq!(config.batch_size, 100);
    assert_eq!(config.max_attempts, 5);
    assert_eq!(config.sync_interval(), Duration::from_secs(30));
    assert_eq!(config.gc_interval(), Duration::from_secs(3_600));
    assert!(config.store_ids.is_empty());
}

#[test]
fn partial_json_keeps_other_defaults() {
    let config = SyncConfig::from_json_str(
        r#"{ "user_id": "staff-7", "max_attempts": 8, "store_ids": ["store-1"] }"#,
    )
    .unwrap();
    assert_eq!(config.user_id.as_str(), "staff-7");
    assert_eq!(config.max_attempts, 8);
    assert_eq!(config.store_ids.len(), 1);
    assert_eq!(config.batch_size, 100);
    assert_eq!(config.backoff_base_ms, 500);
}

#[test]
fn class_overrides_apply_on_top_of_defaults() {
    let config = SyncConfig::from_json_str(
        r#"{
            "class_overrides": {
                "catalog": { "conflict_policy": "last_writer_wins", "retention_days": 7 },
                "scheduling": { "priority": 0 }
            }
        }"#,
    )
    .unwrap();
    let policies = config.class_policies().unwrap();

    let catalog = policies.get(EntityClass::Catalog);
    assert_eq!(catalog.conflict_policy, ConflictPolicy::LastWriterWins);
    assert_eq!(catalog.retention(), Duration::from_secs(7 * 24 * 3600));
    assert_eq!(catalog.priority, EntityClass::Catalog.default_policy().priority);

    assert_eq!(policies.get(EntityClass::Scheduling).priority, 0);
    assert_eq!(
        policies.get(EntityClass::Financial),
        EntityClass::Financial.default_policy()
    );
}

#[test]
fn last_writer_wins_is_refused_for_money() {
    for class in ["financial", "approval"] {
        let json = format!(
            r#"{{ "class_overrides": {{ "{class}": {{ "conflict_policy": "last_writer_wins" }} }} }}"#
        );
        let err = SyncConfig::from_json_str(&json).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "{class}: {err}");
    }
}

#[test]
fn invalid_limits_are_rejected() {
    for json in [
        r#"{ "batch_size": 0 }"#,
        r#"{ "max_attempts": 0 }"#,
        r#"{ "backoff_base_ms": 1000, "backoff_max_ms": 10 }"#,
        r#"{ "sync_interval_ms": 0 }"#,
    ] {
        let err = SyncConfig::from_json_str(json).unwrap_err();
        assert!(matches!(err, SyncError::Config(_)), "{json}: {err}");
    }
}

#[test]
fn malformed_json_is_a_config_error() {
    let err = SyncConfig::from_json_str("{ batch_size: ").unwrap_err();
    assert!(matches!(err, SyncError::Config(_)));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, r#"{{ "batch_size": 25, "gc_interval_ms": 60000 }}"#).unwrap();

    let config = SyncConfig::from_file(file.path()).unwrap();
    assert_eq!(config.batch_size, 25);
    assert_eq!(config.gc_interval(), Duration::from_secs(60));

    let missing = SyncConfig::from_file(file.path().with_extension("missing"));
    assert!(matches!(missing, Err(SyncError::Io(_))));
}

#[test]
fn config_round_trips_through_json() {
    let config = SyncConfig::default();
    let json = serde_json::to_string(&config).unwrap();
    assert_eq!(SyncConfig::from_json_str(&json).unwrap(), config);
}
