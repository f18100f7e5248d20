//! Property-based tests for reachability escalation timing.
//!
//! The ledger must ask for escalation exactly once: at the first failing
//! test after the grace period, and never again once the escalation was
//! acknowledged with `set_reported`.

use proptest::prelude::*;
use std::time::{Duration, Instant};
use storage_server::reachability::{ReachabilityLedger, UNREACH_GRACE_PERIOD};

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Feed a monotone sequence of failure times and check the report
    /// fires exactly at the first offset beyond the grace period.
    #[test]
    fn prop_escalates_exactly_once_after_grace(
        mut offsets_secs in prop::collection::vec(0u64..20_000, 1..20),
    ) {
        offsets_secs.sort_unstable();
        let t0 = Instant::now();
        let mut ledger = ReachabilityLedger::new();

        // first failure creates the record at t0
        prop_assert!(!ledger.record_unreachable_at("pk", t0));

        let mut reported = false;
        for offset in offsets_secs {
            let now = t0 + Duration::from_secs(offset);
            let should_report = ledger.record_unreachable_at("pk", now);

            let beyond_grace = Duration::from_secs(offset) > UNREACH_GRACE_PERIOD;
            if should_report {
                prop_assert!(beyond_grace);
                prop_assert!(!reported);
                ledger.set_reported("pk");
                reported = true;
            } else {
                // either still within grace, or already reported
                prop_assert!(!beyond_grace || reported);
            }
        }
    }

    /// A success wipes the history: the grace period restarts from the
    /// next failure.
    #[test]
    fn prop_expire_restarts_grace(
        gap_secs in 1u64..100_000,
    ) {
        let t0 = Instant::now();
        let mut ledger = ReachabilityLedger::new();

        ledger.record_unreachable_at("pk", t0);
        prop_assert!(ledger.expire("pk"));

        let t1 = t0 + Duration::from_secs(gap_secs);
        // recreated: never reports on the tick that (re)inserts it
        prop_assert!(!ledger.record_unreachable_at("pk", t1));
        // and one second later it only reports if a full grace period
        // passed since t1, not since t0
        let report = ledger.record_unreachable_at("pk", t1 + Duration::from_secs(1));
        prop_assert!(!report);
    }

    /// `next_to_test` always returns the least recently tested entry.
    #[test]
    fn prop_next_to_test_is_oldest(
        offsets in prop::collection::hash_set(0u64..10_000, 1..10),
    ) {
        let t0 = Instant::now();
        let mut ledger = ReachabilityLedger::new();

        let mut last_tested: Vec<(String, u64)> = Vec::new();
        for (i, offset) in offsets.iter().enumerate() {
            let pk = format!("pk{i}");
            ledger.record_unreachable_at(&pk, t0 + Duration::from_secs(*offset));
            last_tested.push((pk, *offset));
        }

        let expected = last_tested
            .iter()
            .min_by_key(|(_, offset)| *offset)
            .map(|(pk, _)| pk.clone());
        prop_assert_eq!(ledger.next_to_test(), expected);
    }
}
