//! Shared proptest strategies for the storage server test suite.
//!
//! Provides generators for user pubkeys, service node records, swarm
//! snapshots and messages.

use common::{Message, SnodeRecord, SwarmInfo};
use proptest::prelude::*;
use std::collections::HashSet;

/// A valid 64-character hex user pubkey.
pub fn user_pubkey_strategy() -> impl Strategy<Value = String> {
    "[a-f0-9]{64}"
}

/// A swarm id, never the reserved invalid value.
pub fn swarm_id_strategy() -> impl Strategy<Value = u64> {
    0u64..u64::MAX
}

/// Deterministic record for a one-byte node seed.
pub fn record_from_seed(seed: u8) -> SnodeRecord {
    let pk = hex::encode([seed; 32]);
    SnodeRecord::new(&pk, &pk, &pk, "10.0.0.1", 22021).expect("seeded record is valid")
}

/// A snapshot of 1..=8 swarms with unique ids and 1..=4 members each.
/// Member seeds start at 1 so that seed 0 can be reserved for "us".
pub fn snapshot_strategy() -> impl Strategy<Value = Vec<SwarmInfo>> {
    prop::collection::vec(
        (swarm_id_strategy(), prop::collection::vec(1u8..=255, 1..=4)),
        1..=8,
    )
    .prop_map(|raw| {
        let mut seen_ids = HashSet::new();
        let mut seen_members = HashSet::new();
        raw.into_iter()
            .filter(|(id, _)| seen_ids.insert(*id))
            .map(|(swarm_id, seeds)| SwarmInfo {
                swarm_id,
                snodes: seeds
                    .into_iter()
                    .filter(|seed| seen_members.insert(*seed))
                    .map(record_from_seed)
                    .collect(),
            })
            .filter(|swarm| !swarm.snodes.is_empty())
            .collect()
    })
    .prop_filter("snapshot must not be empty", |swarms: &Vec<SwarmInfo>| {
        !swarms.is_empty()
    })
}

/// A message with bounded payload, live for an hour from `now`.
pub fn message_strategy(now_ms: u64) -> impl Strategy<Value = Message> {
    (
        user_pubkey_strategy(),
        "[a-zA-Z0-9 ]{1,64}",
        "[a-f0-9]{32}",
        "[a-f0-9]{8,16}",
    )
        .prop_map(move |(pubkey, data, hash, nonce)| Message {
            pubkey,
            data,
            hash,
            ttl_ms: 3_600_000,
            timestamp_ms: now_ms,
            nonce,
        })
}
