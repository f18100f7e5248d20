//! Bookkeeping for peers that fail audits.
//!
//! A peer enters the ledger on its first failed test and leaves it on any
//! success. Once a peer has been failing for longer than the grace period,
//! `record_unreachable` asks the caller (exactly once) to escalate it to
//! the daemon for a deregistration vote; `set_reported` is only called
//! after the escalation RPC succeeded, so a failed escalation is retried
//! on the next failing test.

use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::debug;

/// How long a peer may keep failing before we report it.
pub const UNREACH_GRACE_PERIOD: Duration = Duration::from_secs(120 * 60);

#[derive(Debug, Clone)]
struct ReachRecord {
    first_failure: Instant,
    last_tested: Instant,
    reported: bool,
}

#[derive(Debug, Default)]
pub struct ReachabilityLedger {
    offline_nodes: HashMap<String, ReachRecord>,
}

impl ReachabilityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed test for `pubkey`. Returns true exactly once when
    /// the peer has been failing beyond the grace period and has not been
    /// reported yet.
    pub fn record_unreachable(&mut self, pubkey: &str) -> bool {
        self.record_unreachable_at(pubkey, Instant::now())
    }

    pub fn record_unreachable_at(&mut self, pubkey: &str, now: Instant) -> bool {
        match self.offline_nodes.get_mut(pubkey) {
            None => {
                debug!(peer = %pubkey, "Adding a new node to the unreachable set");
                self.offline_nodes.insert(
                    pubkey.to_string(),
                    ReachRecord {
                        first_failure: now,
                        last_tested: now,
                        reported: false,
                    },
                );
                false
            }
            Some(record) => {
                record.last_tested = now;
                let elapsed = now.duration_since(record.first_failure);
                debug!(
                    peer = %pubkey,
                    elapsed_secs = elapsed.as_secs(),
                    reported = record.reported,
                    "Node is still unreachable"
                );
                !record.reported && elapsed > UNREACH_GRACE_PERIOD
            }
        }
    }

    /// Remove a peer after a successful test. Returns whether it was
    /// present.
    pub fn expire(&mut self, pubkey: &str) -> bool {
        let erased = self.offline_nodes.remove(pubkey).is_some();
        if erased {
            debug!(peer = %pubkey, "Removed reachability entry");
        }
        erased
    }

    /// Mark a peer as escalated. Only called after the daemon accepted the
    /// report.
    pub fn set_reported(&mut self, pubkey: &str) {
        if let Some(record) = self.offline_nodes.get_mut(pubkey) {
            record.reported = true;
        }
    }

    /// The unreachable peer least recently retested, if any.
    pub fn next_to_test(&self) -> Option<String> {
        self.offline_nodes
            .iter()
            .min_by_key(|(_, record)| record.last_tested)
            .map(|(pubkey, _)| pubkey.clone())
    }

    pub fn len(&self) -> usize {
        self.offline_nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offline_nodes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_failure_never_reports() {
        let mut ledger = ReachabilityLedger::new();
        assert!(!ledger.record_unreachable_at("pk", Instant::now()));
        assert_eq!(ledger.len(), 1);
    }

    #[test]
    fn test_reports_once_after_grace_period() {
        let mut ledger = ReachabilityLedger::new();
        let t0 = Instant::now();
        assert!(!ledger.record_unreachable_at("pk", t0));
        assert!(!ledger.record_unreachable_at("pk", t0 + 119 * MIN));
        assert!(ledger.record_unreachable_at("pk", t0 + 121 * MIN));

        // escalation succeeded
        ledger.set_reported("pk");
        assert!(!ledger.record_unreachable_at("pk", t0 + 200 * MIN));
    }

    #[test]
    fn test_failed_escalation_retries() {
        let mut ledger = ReachabilityLedger::new();
        let t0 = Instant::now();
        ledger.record_unreachable_at("pk", t0);
        // caller could not reach the daemon, so set_reported is never
        // called; the next tick must ask again
        assert!(ledger.record_unreachable_at("pk", t0 + 121 * MIN));
        assert!(ledger.record_unreachable_at("pk", t0 + 122 * MIN));
    }

    #[test]
    fn test_expire_resets_history() {
        let mut ledger = ReachabilityLedger::new();
        let t0 = Instant::now();
        ledger.record_unreachable_at("pk", t0);
        assert!(ledger.expire("pk"));
        assert!(!ledger.expire("pk"));
        // re-added with a fresh first_failure
        assert!(!ledger.record_unreachable_at("pk", t0 + 121 * MIN));
    }

    #[test]
    fn test_next_to_test_is_least_recently_tested() {
        let mut ledger = ReachabilityLedger::new();
        let t0 = Instant::now();
        ledger.record_unreachable_at("a", t0);
        ledger.record_unreachable_at("b", t0 + MIN);
        ledger.record_unreachable_at("a", t0 + 2 * MIN);
        assert_eq!(ledger.next_to_test(), Some("b".to_string()));
        assert!(ReachabilityLedger::new().next_to_test().is_none());
    }
}
