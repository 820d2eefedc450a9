//! Property-based tests for identifiers and timestamps.

use proptest::prelude::*;
use std::time::Duration;
use tillsync_types::{DeviceId, EntityId, Timestamp};

fn millis() -> impl Strategy<Value = i64> {
    // Within chrono's representable range.
    -8_000_000_000_000i64..8_000_000_000_000
}

proptest! {
    #[test]
    fn entity_id_parses_its_display(raw in any::<u128>()) {
        let id = EntityId::from_uuid(uuid::Uuid::from_u128(raw));
        prop_assert_eq!(EntityId::parse(&id.to_string()).unwrap(), id);
        prop_assert_eq!(id.to_string().parse::<EntityId>().unwrap(), id);
    }

    #[test]
    fn device_id_order_follows_uuid_order(a in any::<u128>(), b in any::<u128>()) {
        let da = DeviceId::from_uuid(uuid::Uuid::from_u128(a));
        let db = DeviceId::from_uuid(uuid::Uuid::from_u128(b));
        prop_assert_eq!(da.cmp(&db), a.cmp(&b));
    }

    #[test]
    fn plus_never_moves_backwards(start in millis(), delay_ms in any::<u64>()) {
        let ts = Timestamp::from_millis(start);
        let later = ts.plus(Duration::from_millis(delay_ms));
        prop_assert!(later >= ts);
        prop_assert_eq!(later == ts, delay_ms == 0);
    }

    #[test]
    fn is_before_matches_millis_order(a in millis(), b in millis()) {
        let ta = Timestamp::from_millis(a);
        let tb = Timestamp::from_millis(b);
        prop_assert_eq!(ta.is_before(&tb), a < b);
    }

    #[test]
    fn datetime_conversion_is_lossless(ms in millis()) {
        let ts = Timestamp::from_millis(ms);
        let dt = ts.to_datetime().unwrap();
        prop_assert_eq!(Timestamp::from(dt), ts);
    }
}
