//! Initiator side of peer auditing.
//!
//! Three loops: storage tests challenge a random swarm peer to produce a
//! message we hold, blockchain tests challenge a random funded node to
//! report a deterministically sampled block hash, and the retest loop
//! re-pings peers already in the reachability ledger. Outcomes feed the
//! ledger; when a peer has been failing beyond the grace period the
//! coordinator escalates it to the daemon for a deregistration vote.

use crate::service_node::{derive_test_height, send_signed, snode_ready, with_store};
use crate::state::AppState;
use rand::Rng;
use serde::Deserialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

const STORAGE_TEST_PERIOD: Duration = Duration::from_secs(10);
const BLOCKCHAIN_TEST_PERIOD: Duration = Duration::from_secs(100);
const RETEST_PERIOD: Duration = Duration::from_secs(60);

/// Never sample blocks this close to the tip; peers may not have them yet.
const BLOCK_SAFETY_MARGIN: u64 = 10;

#[derive(Deserialize)]
struct StorageTestResponse {
    status: String,
    #[serde(default)]
    value: String,
}

#[derive(Deserialize)]
struct BlockchainTestResponse {
    res_height: u64,
    res_hash: String,
}

/// Record a test outcome and escalate when the ledger asks for it.
async fn report_test_result(state: &Arc<AppState>, peer_pubkey: &str, passed: bool) {
    if passed {
        state.metrics.tests_passed.inc();
        let was_failing = state.reachability.lock().expire(peer_pubkey);
        if was_failing {
            info!(peer = %peer_pubkey, "Previously unreachable node is back online");
        }
        return;
    }

    state.metrics.tests_failed.inc();
    let should_report = state.reachability.lock().record_unreachable(peer_pubkey);
    if should_report {
        info!(peer = %peer_pubkey, "Reporting long-unreachable node to the daemon");
        match state.daemon.report_unreachable_peer(peer_pubkey).await {
            Ok(()) => state.reachability.lock().set_reported(peer_pubkey),
            // leave `reported` unset so the next failing test retries
            Err(e) => warn!(peer = %peer_pubkey, error = %e, "Deregistration vote failed"),
        }
    }
}

// ============================================================================
// Storage tests
// ============================================================================

pub async fn run_storage_test_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(STORAGE_TEST_PERIOD);
    loop {
        ticker.tick().await;
        if snode_ready(&state).is_err() {
            continue;
        }
        let Some(peer) = state.swarm.read().choose_swarm_peer() else {
            continue;
        };
        let now = common::now_ms();
        let message = match with_store(&state, move |store| store.random_live_message(now)).await {
            Ok(Some(message)) => message,
            Ok(None) => continue,
            Err(e) => {
                warn!(error = %e, "Could not sample a message for a storage test");
                continue;
            }
        };

        let passed = storage_test(&state, &peer, &message.hash, &message.data).await;
        debug!(peer = %peer, hash = %message.hash, passed, "Storage test finished");
        report_test_result(&state, &peer.pubkey_hex, passed).await;
    }
}

async fn storage_test(
    state: &Arc<AppState>,
    peer: &common::SnodeRecord,
    msg_hash: &str,
    expected_data: &str,
) -> bool {
    let height = state.height.load(Ordering::SeqCst);
    let body = serde_json::json!({ "height": height, "hash": msg_hash })
        .to_string()
        .into_bytes();

    let response = match send_signed(state, peer, "/swarms/storage_test/v1", body).await {
        Ok(res) if res.status().is_success() => res,
        Ok(res) => {
            debug!(peer = %peer, status = %res.status(), "Storage test rejected");
            return false;
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Storage test unreachable");
            return false;
        }
    };

    match response.json::<StorageTestResponse>().await {
        Ok(answer) if answer.status == "OK" => answer.value == expected_data,
        Ok(answer) => {
            debug!(peer = %peer, status = %answer.status, "Storage test not OK");
            false
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Storage test answer unparsable");
            false
        }
    }
}

// ============================================================================
// Blockchain tests
// ============================================================================

pub async fn run_blockchain_test_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(BLOCKCHAIN_TEST_PERIOD);
    loop {
        ticker.tick().await;
        if snode_ready(&state).is_err() {
            continue;
        }
        let height = state.height.load(Ordering::SeqCst);
        if height <= BLOCK_SAFETY_MARGIN {
            continue;
        }
        let Some(target) = state.swarm.read().choose_funded_node() else {
            continue;
        };

        let max_height = height - BLOCK_SAFETY_MARGIN;
        let seed: u64 = rand::thread_rng().gen();

        // our own answer first; a daemon hiccup must not penalize the peer
        let expected_height = derive_test_height(seed, max_height);
        let expected_hash = match state.daemon.get_block_hash(expected_height).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!(error = %e, "Skipping blockchain test, daemon lookup failed");
                continue;
            }
        };

        let passed = blockchain_test(
            &state,
            &target,
            max_height,
            seed,
            height,
            expected_height,
            &expected_hash,
        )
        .await;
        debug!(peer = %target, passed, "Blockchain test finished");
        report_test_result(&state, &target.pubkey_hex, passed).await;
    }
}

async fn blockchain_test(
    state: &Arc<AppState>,
    peer: &common::SnodeRecord,
    max_height: u64,
    seed: u64,
    height: u64,
    expected_height: u64,
    expected_hash: &str,
) -> bool {
    let body = serde_json::json!({
        "max_height": max_height,
        "seed": seed,
        "height": height,
    })
    .to_string()
    .into_bytes();

    let response = match send_signed(state, peer, "/swarms/blockchain_test/v1", body).await {
        Ok(res) if res.status().is_success() => res,
        Ok(res) => {
            debug!(peer = %peer, status = %res.status(), "Blockchain test rejected");
            return false;
        }
        Err(e) => {
            debug!(peer = %peer, error = %e, "Blockchain test unreachable");
            return false;
        }
    };

    match response.json::<BlockchainTestResponse>().await {
        Ok(answer) => answer.res_height == expected_height && answer.res_hash == expected_hash,
        Err(e) => {
            debug!(peer = %peer, error = %e, "Blockchain test answer unparsable");
            false
        }
    }
}

// ============================================================================
// Retesting unreachable peers
// ============================================================================

pub async fn run_retest_loop(state: Arc<AppState>) {
    let mut ticker = tokio::time::interval(RETEST_PERIOD);
    loop {
        ticker.tick().await;
        let Some(pubkey) = state.reachability.lock().next_to_test() else {
            continue;
        };
        let Some(record) = state.swarm.read().get_node_by_pubkey(&pubkey) else {
            // no longer registered; nothing left to report on
            state.reachability.lock().expire(&pubkey);
            continue;
        };

        let reachable = match send_signed(&state, &record, "/swarms/ping_test/v1", Vec::new()).await
        {
            Ok(res) => res.status().is_success(),
            Err(_) => false,
        };
        debug!(peer = %record, reachable, "Retested unreachable node");
        report_test_result(&state, &pubkey, reachable).await;
    }
}
