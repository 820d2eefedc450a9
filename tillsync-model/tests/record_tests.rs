use pretty_assertions::assert_eq;
use serde::{Deserialize, Serialize};
use tillsync_model::{
    Actor, Envelope, OperationStatus, Record, Scope, StoredRecord, SyncAction, SyncOperation,
    SyncableData,
};
use tillsync_types::{DeviceId, EntityClass, EntityId, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Service {
    name: String,
    price_cents: i64,
}

impl SyncableData for Service {
    const ENTITY_TYPE: &'static str = "service";
    const CLASS: EntityClass = EntityClass::Catalog;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Appointment {
    client: String,
}

impl SyncableData for Appointment {
    const ENTITY_TYPE: &'static str = "appointment";
    const CLASS: EntityClass = EntityClass::Scheduling;
}

fn service_record() -> Record<Service> {
    let actor = Actor::new("staff-1", DeviceId::new());
    Record {
        meta: Envelope::new(
            EntityId::new(),
            &Scope::new("t", "s"),
            &actor,
            Timestamp::from_millis(1),
        ),
        data: Service {
            name: "Haircut".into(),
            price_cents: 3_500,
        },
    }
}

#[test]
fn typed_record_round_trips_through_stored() {
    let record = service_record();
    let stored = record.to_stored().unwrap();

    assert_eq!(stored.entity_type, "service");
    assert_eq!(stored.class, EntityClass::Catalog);
    assert_eq!(stored.data["price_cents"], 3_500);

    let back: Record<Service> = stored.to_record().unwrap();
    assert_eq!(back, record);
}

#[test]
fn restoring_wrong_type_is_rejected() {
    let stored = service_record().to_stored().unwrap();
    let err = stored.to_record::<Appointment>().unwrap_err();
    assert!(err.to_string().contains("expected appointment"));
}

#[test]
fn stored_record_survives_json() {
    let stored = service_record().to_stored().unwrap();
    let json = serde_json::to_string(&stored).unwrap();
    let back: StoredRecord = serde_json::from_str(&json).unwrap();
    assert_eq!(back, stored);
}

#[test]
fn same_content_ignores_envelope_metadata() {
    let stored = service_record().to_stored().unwrap();
    let mut other = stored.clone();
    other.meta.updated_at = Timestamp::from_millis(99);
    assert!(stored.same_content(&other));

    other.data["price_cents"] = serde_json::json!(4_000);
    assert!(!stored.same_content(&other));
}

#[test]
fn operation_takes_key_from_payload() {
    let stored = service_record().to_stored().unwrap();
    let op = SyncOperation::new(
        SyncAction::Create,
        stored.clone(),
        4,
        5,
        Timestamp::from_millis(7),
    );

    assert_eq!(op.key(), (stored.meta.id, 1));
    assert_eq!(op.entity_type, "service");
    assert_eq!(op.status, OperationStatus::Pending);
    assert_eq!(op.next_attempt_at, Timestamp::from_millis(7));
    assert!(op.is_unsent());
    assert!(!op.is_exhausted());
}

#[test]
fn operation_exhausts_at_max_attempts() {
    let stored = service_record().to_stored().unwrap();
    let mut op = SyncOperation::new(SyncAction::Update, stored, 4, 2, Timestamp::from_millis(0));
    op.attempts = 2;
    assert!(op.is_exhausted());
}

#[test]
fn action_and_status_parse() {
    assert_eq!("DELETE".parse::<SyncAction>().unwrap(), SyncAction::Delete);
    assert_eq!(
        "in_flight".parse::<OperationStatus>().unwrap(),
        OperationStatus::InFlight
    );
    assert!("delete".parse::<SyncAction>().is_err());
}
