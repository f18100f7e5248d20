//! Service node coordinator: chain refresh, message ingest, replication
//! and bootstrap, plus the responder side of peer audits.
//!
//! Everything here operates on the shared [`AppState`]; background work
//! runs as spawned loops driven by `tokio::time::interval`. Snapshot
//! updates happen under the swarm write lock with no await held, so a
//! request observes either the previous or the new topology, never a mix.

use crate::daemon::DaemonError;
use crate::identity::{SENDER_SNODE_PUBKEY_HEADER, SNODE_SIGNATURE_HEADER};
use crate::state::AppState;
use crate::store::{MessageStore, StoreError};
use common::{codec, swarm_for_pubkey, Message, SnodeRecord, SwarmId, SwarmInfo, UserPubkey};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha20Rng;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// How often the registered node list is refreshed from the daemon.
pub const REFRESH_PERIOD: Duration = Duration::from_secs(10);
const PURGE_PERIOD: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(30);

/// Responder-side storage test retry window.
const STORAGE_TEST_RETRY_PERIOD: Duration = Duration::from_millis(50);
const STORAGE_TEST_WINDOW: Duration = Duration::from_secs(60);
/// Accepted height disagreement between tester and responder.
const STORAGE_TEST_HEIGHT_TOLERANCE: u64 = 2;

// ============================================================================
// Readiness
// ============================================================================

/// The server refuses client and peer work until the node knows where it
/// stands: keys are loaded (guaranteed before `AppState` exists), at least
/// one chain refresh succeeded, and we appear in some swarm. `--force-start`
/// bypasses the gate for operators bringing a node up out of order.
pub fn snode_ready(state: &AppState) -> Result<(), String> {
    if state.force_start {
        return Ok(());
    }
    if !state.refreshed_once.load(Ordering::SeqCst) {
        return Err("not done syncing with the chain yet".to_string());
    }
    if !state.swarm.read().is_valid() {
        return Err("we are not in any swarm yet".to_string());
    }
    Ok(())
}

// ============================================================================
// Store access
// ============================================================================

/// Run a blocking store operation on the worker pool.
pub async fn with_store<T, F>(state: &AppState, op: F) -> Result<T, StoreError>
where
    T: Send + 'static,
    F: FnOnce(&MessageStore) -> Result<T, StoreError> + Send + 'static,
{
    let store = Arc::clone(&state.store);
    match tokio::task::spawn_blocking(move || op(&store)).await {
        Ok(result) => result,
        Err(e) => std::panic::resume_unwind(e.into_panic()),
    }
}

// ============================================================================
// Chain refresh
// ============================================================================

pub async fn run_refresh_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(REFRESH_PERIOD);
    loop {
        ticker.tick().await;
        if let Err(e) = refresh_once(&state).await {
            warn!(error = %e, "Chain refresh failed, retrying on the next tick");
        }
    }
}

/// One refresh: pull the node list, derive events, commit the snapshot
/// atomically, then act on the events.
pub async fn refresh_once(state: &Arc<AppState>) -> anyhow::Result<()> {
    let update = state.daemon.get_service_nodes().await?;

    let events = state.swarm.read().derive_swarm_events(&update.swarms);
    state
        .swarm
        .write()
        .update_state(update.swarms.clone(), update.decommissioned, &events);

    state.height.store(update.height, Ordering::SeqCst);
    state.hardfork.store(update.hardfork, Ordering::SeqCst);
    *state.block_hash.write() = update.block_hash;

    if !state.refreshed_once.swap(true, Ordering::SeqCst) {
        info!(
            height = update.height,
            swarm_id = events.our_swarm_id,
            "Initial chain refresh complete"
        );
    }

    if events.dissolved {
        info!("Our swarm was dissolved, redistributing stored messages");
        let state = Arc::clone(state);
        let swarms = update.swarms.clone();
        tokio::spawn(async move { salvage_data(state, swarms).await });
    } else {
        for peer in &events.new_snodes {
            debug!(peer = %peer, "Bootstrapping new swarm member");
            let state = Arc::clone(state);
            let peer = peer.clone();
            tokio::spawn(async move { bootstrap_peer(state, peer).await });
        }
    }

    for swarm_id in events.new_swarms {
        let state = Arc::clone(state);
        let swarms = update.swarms.clone();
        tokio::spawn(async move { bootstrap_swarm(state, swarm_id, swarms).await });
    }

    Ok(())
}

// ============================================================================
// Ingest and replication
// ============================================================================

/// Insert a message, waking long-poll listeners on a fresh insert and
/// replicating client-originated messages to the current swarm peers.
pub async fn process_store(
    state: &Arc<AppState>,
    message: Message,
    from_client: bool,
) -> Result<(), StoreError> {
    let to_insert = message.clone();
    let newly_stored = with_store(state, move |store| store.insert(&to_insert)).await?;

    if newly_stored {
        let notified = state.listeners.notify(&message);
        if notified > 0 {
            debug!(count = notified, "Woke long-poll listeners");
        }
    }

    if from_client {
        let state = Arc::clone(state);
        tokio::spawn(async move { relay_to_peers(state, message).await });
    }
    Ok(())
}

/// Batch variant used by `push_batch`; never relays further.
pub async fn process_push_batch(
    state: &Arc<AppState>,
    messages: Vec<Message>,
) -> Result<(), StoreError> {
    for message in messages {
        process_store(state, message, false).await?;
    }
    Ok(())
}

async fn relay_to_peers(state: Arc<AppState>, message: Message) {
    let peers = state.swarm.read().other_nodes().to_vec();
    let body = codec::serialize_messages(std::slice::from_ref(&message));
    for peer in peers {
        let state = Arc::clone(&state);
        let body = body.clone();
        tokio::spawn(async move {
            match send_signed(&state, &peer, "/swarms/push/v1", body).await {
                Ok(res) if res.status().is_success() => {}
                Ok(res) => {
                    state.metrics.replication_failures.inc();
                    warn!(peer = %peer, status = %res.status(), "Peer rejected message push");
                }
                Err(e) => {
                    state.metrics.replication_failures.inc();
                    debug!(peer = %peer, error = %e, "Message push failed");
                }
            }
        });
    }
}

/// Send a signed request to a peer. The body signature and our base32z
/// address form the request envelope peers authenticate against.
pub async fn send_signed(
    state: &AppState,
    peer: &SnodeRecord,
    path: &str,
    body: Vec<u8>,
) -> anyhow::Result<reqwest::Response> {
    let url = format!("https://{}:{}{}", peer.ip, peer.port, path);
    let signature = state.identity.sign(&body);
    let response = state
        .peer_http
        .post(url)
        .header(SENDER_SNODE_PUBKEY_HEADER, state.identity.address_b32z())
        .header(SNODE_SIGNATURE_HEADER, signature)
        .body(body)
        .send()
        .await?;
    Ok(response)
}

// ============================================================================
// Bootstrap
// ============================================================================

async fn live_messages(state: &Arc<AppState>) -> Vec<Message> {
    let now = common::now_ms();
    match with_store(state, move |store| store.all_live(now)).await {
        Ok(messages) => messages,
        Err(e) => {
            warn!(error = %e, "Could not read messages for bootstrap");
            Vec::new()
        }
    }
}

async fn push_batch_to(state: &Arc<AppState>, peer: &SnodeRecord, messages: &[Message]) {
    if messages.is_empty() {
        return;
    }
    let body = codec::serialize_messages(messages);
    match send_signed(state, peer, "/swarms/push_batch/v1", body).await {
        Ok(res) if res.status().is_success() => {
            info!(peer = %peer, count = messages.len(), "Bootstrapped peer");
        }
        Ok(res) => {
            state.metrics.replication_failures.inc();
            warn!(peer = %peer, status = %res.status(), "Peer rejected push batch");
        }
        Err(e) => {
            state.metrics.replication_failures.inc();
            warn!(peer = %peer, error = %e, "Push batch failed");
        }
    }
}

/// A peer joined our swarm: hand it everything we hold.
async fn bootstrap_peer(state: Arc<AppState>, peer: SnodeRecord) {
    let messages = live_messages(&state).await;
    push_batch_to(&state, &peer, &messages).await;
}

/// A swarm appeared: hand it the messages its arc now owns.
async fn bootstrap_swarm(state: Arc<AppState>, swarm_id: SwarmId, swarms: Vec<SwarmInfo>) {
    let members = match swarms.iter().find(|s| s.swarm_id == swarm_id) {
        Some(swarm) => swarm.snodes.clone(),
        None => return,
    };
    let messages: Vec<Message> = live_messages(&state)
        .await
        .into_iter()
        .filter(|msg| {
            UserPubkey::create(&msg.pubkey, &state.params)
                .map(|pk| swarm_for_pubkey(&swarms, &pk) == swarm_id)
                .unwrap_or(false)
        })
        .collect();
    if messages.is_empty() {
        return;
    }
    info!(swarm_id, count = messages.len(), "Bootstrapping new swarm");
    for member in &members {
        push_batch_to(&state, member, &messages).await;
    }
}

/// Our swarm dissolved: every stored message now belongs to some other
/// swarm; push each group to its new owners.
async fn salvage_data(state: Arc<AppState>, swarms: Vec<SwarmInfo>) {
    let our_pubkey = state.identity.pubkey_hex();
    let messages = live_messages(&state).await;

    let mut by_swarm: std::collections::HashMap<SwarmId, Vec<Message>> =
        std::collections::HashMap::new();
    for msg in messages {
        let Some(pk) = UserPubkey::create(&msg.pubkey, &state.params) else {
            continue;
        };
        by_swarm
            .entry(swarm_for_pubkey(&swarms, &pk))
            .or_default()
            .push(msg);
    }

    for (swarm_id, group) in by_swarm {
        let members = swarms
            .iter()
            .find(|s| s.swarm_id == swarm_id)
            .map(|s| s.snodes.clone())
            .unwrap_or_default();
        for member in members.iter().filter(|m| m.pubkey_hex != our_pubkey) {
            push_batch_to(&state, member, &group).await;
        }
    }
}

// ============================================================================
// Audit responders
// ============================================================================

/// Responder-side storage test outcome.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageTestStatus {
    Success(String),
    Retry,
    WrongReq,
    Other,
}

fn storage_test_attempt(state: &AppState, height: u64, msg_hash: &str) -> TestProbe {
    let our_height = state.height.load(Ordering::SeqCst);
    if height > our_height {
        // our daemon may simply be lagging behind the tester's
        return TestProbe::HeightPending;
    }
    if our_height - height > STORAGE_TEST_HEIGHT_TOLERANCE {
        return TestProbe::WrongHeight;
    }
    TestProbe::CheckStore
}

enum TestProbe {
    HeightPending,
    WrongHeight,
    CheckStore,
}

/// Answer a peer's storage test. RETRY states re-poll the store every
/// 50 ms for up to a minute before giving up, covering replication lag
/// between the tester's insert and ours.
pub async fn process_storage_test_req(
    state: &Arc<AppState>,
    height: u64,
    msg_hash: String,
) -> MessageTestStatus {
    let deadline = Instant::now() + STORAGE_TEST_WINDOW;
    let mut attempts: u32 = 0;
    loop {
        attempts += 1;
        let status = match storage_test_attempt(state, height, &msg_hash) {
            TestProbe::WrongHeight => MessageTestStatus::WrongReq,
            TestProbe::HeightPending => MessageTestStatus::Retry,
            TestProbe::CheckStore => {
                let hash = msg_hash.clone();
                match with_store(state, move |store| store.get_by_hash(&hash)).await {
                    Ok(Some(message)) => MessageTestStatus::Success(message.data),
                    Ok(None) => MessageTestStatus::Retry,
                    Err(e) => {
                        warn!(error = %e, "Storage test store lookup failed");
                        MessageTestStatus::Other
                    }
                }
            }
        };

        match status {
            MessageTestStatus::Retry if Instant::now() < deadline => {
                tokio::time::sleep(STORAGE_TEST_RETRY_PERIOD).await;
            }
            final_status => {
                debug!(attempts, ?final_status, "Storage test answered");
                return final_status;
            }
        }
    }
}

/// Parameters of a blockchain test as sent by the initiator.
#[derive(Debug, Clone, Copy)]
pub struct BcTestParams {
    pub max_height: u64,
    pub seed: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BcTestAnswer {
    pub res_height: u64,
    pub res_hash: String,
}

/// Deterministic sample of a block height in `[0, max_height]`. Both
/// sides of a blockchain test run this with the same seed.
pub fn derive_test_height(seed: u64, max_height: u64) -> u64 {
    let mut rng = ChaCha20Rng::seed_from_u64(seed);
    rng.gen_range(0..=max_height)
}

/// Answer a blockchain test by looking the sampled block up in our own
/// daemon.
pub async fn perform_blockchain_test(
    state: &AppState,
    params: BcTestParams,
) -> Result<BcTestAnswer, DaemonError> {
    let res_height = derive_test_height(params.seed, params.max_height);
    let res_hash = state.daemon.get_block_hash(res_height).await?;
    Ok(BcTestAnswer {
        res_height,
        res_hash,
    })
}

// ============================================================================
// Housekeeping loops
// ============================================================================

pub async fn run_purge_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(PURGE_PERIOD);
    loop {
        ticker.tick().await;
        let now = common::now_ms();
        match with_store(&state, move |store| store.purge_expired(now)).await {
            Ok(0) => {}
            Ok(removed) => debug!(removed, "Purged expired messages"),
            Err(e) => warn!(error = %e, "Failed to purge expired messages"),
        }
    }
}

pub async fn run_ping_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    loop {
        ticker.tick().await;
        if let Err(e) = state
            .daemon
            .storage_server_ping(env!("CARGO_PKG_VERSION"))
            .await
        {
            warn!(error = %e, "Failed to ping the daemon");
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::identity::IdentityKeys;
    use crate::store::MessageStore;
    use crate::swarm::Swarm;
    use common::{Network, NetworkParams, SwarmEvents};

    pub(crate) fn test_state() -> (tempfile::TempDir, Arc<AppState>) {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(
            IdentityKeys::from_hex(
                &hex::encode([11u8; 32]),
                &hex::encode([22u8; 32]),
                &hex::encode([33u8; 32]),
            )
            .unwrap(),
        );
        let store = Arc::new(MessageStore::open(dir.path().join("storage.db")).unwrap());
        let our_record = identity.our_record("10.0.0.1", 22021).unwrap();
        let state = AppState::new(
            NetworkParams::new(Network::Mainnet),
            identity,
            crate::daemon::DaemonClient::new("127.0.0.1", 1),
            store,
            Swarm::new(our_record),
            false,
        );
        (dir, Arc::new(state))
    }

    fn message(hash: &str) -> Message {
        Message {
            pubkey: "a".repeat(64),
            data: format!("payload-{hash}"),
            hash: hash.to_string(),
            ttl_ms: 60_000,
            timestamp_ms: common::now_ms(),
            nonce: "n".into(),
        }
    }

    #[test]
    fn test_not_ready_until_refresh_and_swarm() {
        let (_dir, state) = test_state();
        assert!(snode_ready(&state).is_err());

        state.refreshed_once.store(true, Ordering::SeqCst);
        // still no swarm assignment
        assert!(snode_ready(&state).is_err());

        let our = state.swarm.read().our_address().clone();
        let snapshot = vec![SwarmInfo {
            swarm_id: 1,
            snodes: vec![our],
        }];
        let events = state.swarm.read().derive_swarm_events(&snapshot);
        state.swarm.write().update_state(snapshot, vec![], &events);
        assert!(snode_ready(&state).is_ok());
    }

    #[test]
    fn test_force_start_bypasses_gate() {
        let (_dir, state) = test_state();
        assert!(snode_ready(&state).is_err());
        let forced = AppState {
            force_start: true,
            ..match Arc::try_unwrap(state) {
                Ok(state) => state,
                Err(_) => unreachable!(),
            }
        };
        assert!(snode_ready(&forced).is_ok());
    }

    #[tokio::test]
    async fn test_ingest_notifies_listeners_once() {
        let (_dir, state) = test_state();
        let (_guard, rx) = state.listeners.register(&"a".repeat(64));

        process_store(&state, message("h1"), false).await.unwrap();
        assert_eq!(rx.await.unwrap().hash, "h1");

        // duplicate insert must not notify again
        let (_guard2, rx2) = state.listeners.register(&"a".repeat(64));
        process_store(&state, message("h1"), false).await.unwrap();
        assert_eq!(state.listeners.len(), 1);
        drop(rx2);
    }

    #[tokio::test]
    async fn test_storage_test_success_and_wrong_height() {
        let (_dir, state) = test_state();
        state.height.store(100, Ordering::SeqCst);
        process_store(&state, message("deadbeef"), false)
            .await
            .unwrap();

        let status = process_storage_test_req(&state, 100, "deadbeef".into()).await;
        assert_eq!(status, MessageTestStatus::Success("payload-deadbeef".into()));

        let status = process_storage_test_req(&state, 90, "deadbeef".into()).await;
        assert_eq!(status, MessageTestStatus::WrongReq);
    }

    #[test]
    fn test_blockchain_sample_is_deterministic_and_bounded() {
        let a = derive_test_height(42, 1000);
        let b = derive_test_height(42, 1000);
        assert_eq!(a, b);
        assert!(a <= 1000);
        assert_ne!(derive_test_height(42, 1000), derive_test_height(43, 1000));
        assert_eq!(derive_test_height(7, 0), 0);
    }

    #[test]
    fn test_dissolution_events_flow_into_state() {
        let (_dir, state) = test_state();
        let our = state.swarm.read().our_address().clone();
        let first = vec![SwarmInfo {
            swarm_id: 5,
            snodes: vec![our],
        }];
        let events = state.swarm.read().derive_swarm_events(&first);
        state.swarm.write().update_state(first, vec![], &events);

        let second: Vec<SwarmInfo> = vec![];
        let events: SwarmEvents = state.swarm.read().derive_swarm_events(&second);
        assert!(events.dissolved);
    }
}
