//! Property-based tests for the swarm ring mapping and event derivation.
//!
//! Invariants under test:
//! - the pubkey -> swarm mapping is deterministic and stable under
//!   permutation of the snapshot
//! - `is_pubkey_for_us` agrees with the standalone mapping
//! - removing our swarm from the snapshot always derives `dissolved`
//! - every reported new snode is a member of our current swarm

use crate::strategies::*;
use common::{swarm_for_pubkey, NetworkParams, SwarmInfo, UserPubkey, INVALID_SWARM_ID};
use proptest::prelude::*;
use storage_server::swarm::Swarm;

fn params() -> NetworkParams {
    NetworkParams::new(common::Network::Mainnet)
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    /// Mapping is a pure function of the snapshot *set*: any permutation
    /// of the swarm list yields the same assignment.
    #[test]
    fn prop_mapping_stable_under_permutation(
        swarms in snapshot_strategy().prop_shuffle(),
        pk_hex in user_pubkey_strategy(),
    ) {
        let pk = UserPubkey::create(&pk_hex, &params()).unwrap();
        let chosen = swarm_for_pubkey(&swarms, &pk);

        let mut reversed = swarms.clone();
        reversed.reverse();
        prop_assert_eq!(chosen, swarm_for_pubkey(&reversed, &pk));

        let mut rotated = swarms.clone();
        if !rotated.is_empty() {
            rotated.rotate_left(1);
        }
        prop_assert_eq!(chosen, swarm_for_pubkey(&rotated, &pk));

        // and it is never the reserved id for a non-empty snapshot
        prop_assert_ne!(chosen, INVALID_SWARM_ID);
    }

    /// `is_pubkey_for_us` returns true iff the mapping picks our swarm.
    #[test]
    fn prop_is_pubkey_for_us_agrees_with_mapping(
        mut swarms in snapshot_strategy(),
        pk_hex in user_pubkey_strategy(),
        our_slot in any::<prop::sample::Index>(),
    ) {
        // place ourselves into one of the swarms
        let our_record = record_from_seed(0);
        let slot = our_slot.index(swarms.len());
        swarms[slot].snodes.push(our_record.clone());

        let mut swarm = Swarm::new(our_record);
        let events = swarm.derive_swarm_events(&swarms);
        swarm.update_state(swarms.clone(), vec![], &events);

        let pk = UserPubkey::create(&pk_hex, &params()).unwrap();
        let expected = swarm_for_pubkey(&swarms, &pk) == swarms[slot].swarm_id;
        prop_assert_eq!(swarm.is_pubkey_for_us(&pk), expected);
    }

    /// If the previous swarm id is absent from the new snapshot, the
    /// derived events always say `dissolved`, and the new assignment is
    /// either fresh or invalid.
    #[test]
    fn prop_missing_swarm_derives_dissolution(
        mut swarms in snapshot_strategy(),
        keep_us in any::<bool>(),
    ) {
        let our_record = record_from_seed(0);
        swarms[0].snodes.push(our_record.clone());

        let mut swarm = Swarm::new(our_record.clone());
        let events = swarm.derive_swarm_events(&swarms);
        swarm.update_state(swarms.clone(), vec![], &events);
        let old_id = swarm.our_swarm_id();
        prop_assert_ne!(old_id, INVALID_SWARM_ID);

        // drop our swarm from the snapshot, optionally rehoming us
        let mut next: Vec<SwarmInfo> = swarms
            .iter()
            .filter(|s| s.swarm_id != old_id)
            .cloned()
            .collect();
        if keep_us {
            if let Some(first) = next.first_mut() {
                first.snodes.push(our_record);
            }
        }

        let events = swarm.derive_swarm_events(&next);
        prop_assert!(events.dissolved);
        if keep_us && !next.is_empty() {
            prop_assert_ne!(events.our_swarm_id, old_id);
        } else {
            prop_assert_eq!(events.our_swarm_id, INVALID_SWARM_ID);
        }
    }

    /// Every derived new snode is a current swarm member, and none of
    /// them was a peer before the update.
    #[test]
    fn prop_new_snodes_are_fresh_members(
        swarms in snapshot_strategy(),
        extra_seed in 1u8..=255,
    ) {
        let our_record = record_from_seed(0);
        let mut first = swarms.clone();
        first[0].snodes.push(our_record.clone());

        let mut swarm = Swarm::new(our_record);
        let events = swarm.derive_swarm_events(&first);
        swarm.update_state(first.clone(), vec![], &events);

        let mut second = first.clone();
        let joiner = record_from_seed(extra_seed);
        let already_member = second[0].snodes.contains(&joiner);
        second[0].snodes.push(joiner.clone());

        let events = swarm.derive_swarm_events(&second);
        for new_snode in &events.new_snodes {
            prop_assert!(events.our_swarm_members.contains(new_snode));
        }
        if !already_member {
            prop_assert!(events.new_snodes.contains(&joiner));
        }
    }
}
