//! Local view of the swarm topology.
//!
//! The coordinator feeds every fresh chain snapshot through
//! [`Swarm::derive_swarm_events`] and then commits it with
//! [`Swarm::update_state`]; between refreshes the state is immutable, so
//! readers always observe either the old or the new snapshot, never a
//! hybrid.

use common::{
    swarm_for_pubkey, SnodeRecord, SwarmEvents, SwarmId, SwarmInfo, UserPubkey, INVALID_SWARM_ID,
};
use rand::seq::SliceRandom;
use std::collections::HashSet;
use tracing::info;

pub struct Swarm {
    cur_swarm_id: SwarmId,
    all_valid_swarms: Vec<SwarmInfo>,
    our_address: SnodeRecord,
    /// Members of our swarm, self excluded.
    swarm_peers: Vec<SnodeRecord>,
    /// Union of all swarm members plus decommissioned nodes; the sample
    /// pool for blockchain tests and the authority for envelope senders.
    all_funded_nodes: Vec<SnodeRecord>,
}

impl Swarm {
    pub fn new(our_address: SnodeRecord) -> Self {
        Self {
            cur_swarm_id: INVALID_SWARM_ID,
            all_valid_swarms: Vec::new(),
            our_address,
            swarm_peers: Vec::new(),
            all_funded_nodes: Vec::new(),
        }
    }

    fn is_existing_swarm(&self, swarm_id: SwarmId) -> bool {
        self.all_valid_swarms
            .iter()
            .any(|swarm| swarm.swarm_id == swarm_id)
    }

    /// Extract the relevant differences between the current state and an
    /// incoming snapshot. Pure; call `update_state` to commit.
    pub fn derive_swarm_events(&self, new_swarms: &[SwarmInfo]) -> SwarmEvents {
        let our_pubkey = &self.our_address.pubkey_hex;

        let our_swarm = new_swarms
            .iter()
            .find(|swarm| swarm.snodes.iter().any(|sn| &sn.pubkey_hex == our_pubkey));

        let our_swarm_id = our_swarm.map(|s| s.swarm_id).unwrap_or(INVALID_SWARM_ID);
        let our_swarm_members: Vec<SnodeRecord> = our_swarm
            .map(|swarm| {
                swarm
                    .snodes
                    .iter()
                    .filter(|sn| &sn.pubkey_hex != our_pubkey)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        let dissolved = self.cur_swarm_id != INVALID_SWARM_ID
            && !new_swarms
                .iter()
                .any(|swarm| swarm.swarm_id == self.cur_swarm_id);

        let new_swarm_ids = new_swarms
            .iter()
            .map(|swarm| swarm.swarm_id)
            .filter(|id| !self.is_existing_swarm(*id) && *id != our_swarm_id)
            .collect();

        let old_peers: HashSet<&str> = self
            .swarm_peers
            .iter()
            .map(|sn| sn.pubkey_hex.as_str())
            .collect();
        let new_snodes = our_swarm_members
            .iter()
            .filter(|sn| !old_peers.contains(sn.pubkey_hex.as_str()))
            .cloned()
            .collect();

        SwarmEvents {
            our_swarm_id,
            dissolved,
            new_swarms: new_swarm_ids,
            new_snodes,
            our_swarm_members,
        }
    }

    /// Replace the whole state with a new snapshot. Atomic from the point
    /// of view of readers holding the enclosing lock.
    pub fn update_state(
        &mut self,
        swarms: Vec<SwarmInfo>,
        decommissioned: Vec<SnodeRecord>,
        events: &SwarmEvents,
    ) {
        if events.our_swarm_id != self.cur_swarm_id {
            info!(
                old_swarm_id = self.cur_swarm_id,
                new_swarm_id = events.our_swarm_id,
                "Our swarm assignment changed"
            );
        }
        self.cur_swarm_id = events.our_swarm_id;
        self.swarm_peers = events.our_swarm_members.clone();

        let mut funded: Vec<SnodeRecord> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        for record in swarms
            .iter()
            .flat_map(|swarm| swarm.snodes.iter())
            .chain(decommissioned.iter())
        {
            if seen.insert(record.pubkey_hex.clone()) {
                funded.push(record.clone());
            }
        }
        self.all_funded_nodes = funded;
        self.all_valid_swarms = swarms;
    }

    pub fn is_valid(&self) -> bool {
        self.cur_swarm_id != INVALID_SWARM_ID
    }

    pub fn our_swarm_id(&self) -> SwarmId {
        self.cur_swarm_id
    }

    pub fn our_address(&self) -> &SnodeRecord {
        &self.our_address
    }

    /// Current swarm peers, self excluded.
    pub fn other_nodes(&self) -> &[SnodeRecord] {
        &self.swarm_peers
    }

    pub fn all_valid_swarms(&self) -> &[SwarmInfo] {
        &self.all_valid_swarms
    }

    /// Whether `pk` maps onto our swarm under the current snapshot.
    pub fn is_pubkey_for_us(&self, pk: &UserPubkey) -> bool {
        self.is_valid() && swarm_for_pubkey(&self.all_valid_swarms, pk) == self.cur_swarm_id
    }

    /// Members of the swarm responsible for `pk` (used for wrong-swarm
    /// redirects and `get_snodes_for_pubkey`).
    pub fn snodes_for_pubkey(&self, pk: &UserPubkey) -> Vec<SnodeRecord> {
        let target = swarm_for_pubkey(&self.all_valid_swarms, pk);
        self.all_valid_swarms
            .iter()
            .find(|swarm| swarm.swarm_id == target)
            .map(|swarm| swarm.snodes.clone())
            .unwrap_or_default()
    }

    /// Whether a `<base32z>.snode` address belongs to a funded node.
    pub fn is_snode_address_known(&self, address_b32z: &str) -> bool {
        self.all_funded_nodes
            .iter()
            .any(|sn| sn.base32z_pubkey() == address_b32z)
    }

    pub fn get_node_by_pubkey(&self, pubkey_hex: &str) -> Option<SnodeRecord> {
        self.all_funded_nodes
            .iter()
            .find(|sn| sn.pubkey_hex == pubkey_hex)
            .cloned()
    }

    /// Uniform random funded node other than ourselves, the target pool
    /// for blockchain tests.
    pub fn choose_funded_node(&self) -> Option<SnodeRecord> {
        let candidates: Vec<&SnodeRecord> = self
            .all_funded_nodes
            .iter()
            .filter(|sn| sn.pubkey_hex != self.our_address.pubkey_hex)
            .collect();
        candidates
            .choose(&mut rand::thread_rng())
            .map(|sn| (*sn).clone())
    }

    /// Uniform random swarm peer, the target pool for storage tests.
    pub fn choose_swarm_peer(&self) -> Option<SnodeRecord> {
        self.swarm_peers
            .choose(&mut rand::thread_rng())
            .cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::{Network, NetworkParams};

    fn record(pk_byte: u8) -> SnodeRecord {
        let pk = hex::encode([pk_byte; 32]);
        SnodeRecord::new(&pk, &pk, &pk, "10.0.0.1", 22021).unwrap()
    }

    fn swarm_info(id: SwarmId, members: &[u8]) -> SwarmInfo {
        SwarmInfo {
            swarm_id: id,
            snodes: members.iter().map(|b| record(*b)).collect(),
        }
    }

    fn our_swarm() -> Swarm {
        Swarm::new(record(1))
    }

    #[test]
    fn test_initial_state_is_invalid() {
        let swarm = our_swarm();
        assert!(!swarm.is_valid());
        assert_eq!(swarm.our_swarm_id(), INVALID_SWARM_ID);
    }

    #[test]
    fn test_events_assignment_and_members() {
        let swarm = our_swarm();
        let snapshot = vec![swarm_info(7, &[1, 2, 3]), swarm_info(13, &[4, 5])];
        let events = swarm.derive_swarm_events(&snapshot);
        assert_eq!(events.our_swarm_id, 7);
        assert!(!events.dissolved);
        assert_eq!(events.our_swarm_members.len(), 2);
        // every member of a first snapshot is new
        assert_eq!(events.new_snodes.len(), 2);
        // our own swarm is not listed under new_swarms
        assert_eq!(events.new_swarms, vec![13]);
    }

    #[test]
    fn test_events_dissolution() {
        let mut swarm = our_swarm();
        let first = vec![swarm_info(7, &[1, 2]), swarm_info(13, &[4, 5])];
        let events = swarm.derive_swarm_events(&first);
        swarm.update_state(first, vec![], &events);
        assert_eq!(swarm.our_swarm_id(), 7);

        // swarm 7 disappears and we are not in any remaining swarm
        let second = vec![swarm_info(13, &[4, 5])];
        let events = swarm.derive_swarm_events(&second);
        assert!(events.dissolved);
        assert_eq!(events.our_swarm_id, INVALID_SWARM_ID);
    }

    #[test]
    fn test_events_new_snodes_only() {
        let mut swarm = our_swarm();
        let first = vec![swarm_info(7, &[1, 2])];
        let events = swarm.derive_swarm_events(&first);
        swarm.update_state(first, vec![], &events);

        let second = vec![swarm_info(7, &[1, 2, 3])];
        let events = swarm.derive_swarm_events(&second);
        assert!(!events.dissolved);
        assert_eq!(events.new_snodes, vec![record(3)]);
        assert!(events.new_swarms.is_empty());
    }

    #[test]
    fn test_funded_pool_includes_decommissioned() {
        let mut swarm = our_swarm();
        let snapshot = vec![swarm_info(7, &[1, 2])];
        let events = swarm.derive_swarm_events(&snapshot);
        swarm.update_state(snapshot, vec![record(9)], &events);

        assert!(swarm.is_snode_address_known(record(9).base32z_pubkey()));
        assert!(swarm.get_node_by_pubkey(&record(2).pubkey_hex).is_some());
        assert!(!swarm.is_snode_address_known(&"y".repeat(52)));
    }

    #[test]
    fn test_pubkey_for_us_matches_mapping() {
        let mut swarm = our_swarm();
        let snapshot = vec![swarm_info(100, &[1]), swarm_info(u64::MAX - 1, &[2])];
        let events = swarm.derive_swarm_events(&snapshot);
        swarm.update_state(snapshot.clone(), vec![], &events);

        let params = NetworkParams::new(Network::Mainnet);
        // low ring position, close to swarm 100
        let near = UserPubkey::create(&format!("{}{:016x}", "0".repeat(48), 101u64), &params)
            .unwrap();
        assert!(swarm.is_pubkey_for_us(&near));
        assert_eq!(
            swarm.snodes_for_pubkey(&near),
            snapshot[0].snodes.clone()
        );
    }

    #[test]
    fn test_choose_excludes_self() {
        let mut swarm = our_swarm();
        let snapshot = vec![swarm_info(7, &[1])];
        let events = swarm.derive_swarm_events(&snapshot);
        swarm.update_state(snapshot, vec![], &events);
        // we are the only funded node, so there is nobody to test
        assert!(swarm.choose_funded_node().is_none());
        assert!(swarm.choose_swarm_peer().is_none());
    }
}
