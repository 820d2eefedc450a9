//! Property-based tests for vector clock merge and comparison.

use proptest::prelude::*;
use tillsync_clock::{CausalOrder, VectorClock};
use tillsync_types::DeviceId;

fn devices() -> [DeviceId; 4] {
    // Fixed ids so generated clocks overlap on keys.
    [
        DeviceId::from_uuid(uuid_from(1)),
        DeviceId::from_uuid(uuid_from(2)),
        DeviceId::from_uuid(uuid_from(3)),
        DeviceId::from_uuid(uuid_from(4)),
    ]
}

fn uuid_from(n: u128) -> uuid::Uuid {
    uuid::Uuid::from_u128(n)
}

fn clock_strategy() -> impl Strategy<Value = VectorClock> {
    prop::collection::vec((0usize..4, 0u64..20), 0..6).prop_map(|entries| {
        let devices = devices();
        entries
            .into_iter()
            .map(|(idx, version)| (devices[idx], version))
            .collect()
    })
}

proptest! {
    #[test]
    fn merge_is_commutative(a in clock_strategy(), b in clock_strategy()) {
        prop_assert_eq!(a.merged(&b), b.merged(&a));
    }

    #[test]
    fn merge_is_associative(
        a in clock_strategy(),
        b in clock_strategy(),
        c in clock_strategy(),
    ) {
        prop_assert_eq!(a.merged(&b).merged(&c), a.merged(&b.merged(&c)));
    }

    #[test]
    fn merge_is_idempotent(a in clock_strategy()) {
        prop_assert_eq!(a.merged(&a), a);
    }

    #[test]
    fn merge_dominates_inputs(a in clock_strategy(), b in clock_strategy()) {
        let union = a.merged(&b);
        prop_assert!(union.dominates(&a));
        prop_assert!(union.dominates(&b));
    }

    #[test]
    fn compare_is_antisymmetric(a in clock_strategy(), b in clock_strategy()) {
        let expected = match a.compare(&b) {
            CausalOrder::Before => CausalOrder::After,
            CausalOrder::After => CausalOrder::Before,
            other => other,
        };
        prop_assert_eq!(b.compare(&a), expected);
    }

    #[test]
    fn observing_a_new_maximum_strictly_dominates(
        a in clock_strategy(),
        idx in 0usize..4,
    ) {
        let device = devices()[idx];
        let mut next = a.clone();
        next.observe(device, a.get(&device) + 1);
        prop_assert!(next.strictly_dominates(&a));
    }
}
