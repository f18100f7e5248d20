//! HTTP request handlers: the client RPC surface and the signed peer
//! endpoints.
//!
//! Client bodies are channel-encrypted when the ephemeral-key header is
//! present; the response is sealed under the same key, errors included.
//! Peer endpoints authenticate the signed envelope before touching any
//! state, and every peer response carries the cached certificate
//! signature so callers can pin our TLS identity to the on-chain one.

use crate::channel::EPHEMKEY_HEADER;
use crate::error::RequestError;
use crate::identity::{verify_signature, SENDER_SNODE_PUBKEY_HEADER, SNODE_SIGNATURE_HEADER};
use crate::service_node::{self, snode_ready, with_store, BcTestParams, MessageTestStatus};
use crate::state::AppState;
use axum::body::Bytes;
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{codec, pow, Message, SnodeRecord, UserPubkey};
use serde::Deserialize;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Upper bound on the encrypted client message body.
const MAX_MESSAGE_BODY: usize = 3100;
/// TTL policy bounds, milliseconds.
const TTL_MIN_MS: u64 = 10_000;
const TTL_MAX_MS: u64 = 14 * 24 * 60 * 60 * 1000;
/// Accepted clock drift on client timestamps.
const TIMESTAMP_DRIFT_TOLERANCE_MS: u64 = 10_000;

const LONG_POLL_HEADER: &str = "X-Arqma-Long-Poll";
const LONG_POLL_TIMEOUT: Duration = Duration::from_secs(20);

/// `/get_logs/v1` throttle period.
const LOGS_REQUEST_PERIOD: Duration = Duration::from_secs(1);

type Parts = (StatusCode, String, &'static str);

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/storage_rpc/v1", post(client_rpc))
        .route("/swarms/push/v1", post(swarm_push))
        .route("/swarms/push_batch/v1", post(swarm_push_batch))
        .route("/swarms/storage_test/v1", post(storage_test))
        .route("/swarms/blockchain_test/v1", post(blockchain_test))
        .route("/swarms/ping_test/v1", post(ping_test))
        .route("/get_stats/v1", get(get_stats))
        .route("/get_logs/v1", get(get_logs))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

pub fn snodes_to_json(snodes: &[SnodeRecord]) -> serde_json::Value {
    json!({
        "snodes": snodes
            .iter()
            .map(|sn| {
                json!({
                    "address": sn.address,
                    "pubkey_x25519": sn.pubkey_x25519_hex,
                    "pubkey_ed25519": sn.pubkey_ed25519_hex,
                    "port": sn.port.to_string(),
                    "ip": sn.ip,
                })
            })
            .collect::<Vec<_>>()
    })
}

// ============================================================================
// Client RPC
// ============================================================================

async fn client_rpc(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    if state
        .rate_limiter
        .should_rate_limit_client(&addr.ip().to_string())
    {
        debug!(client = %addr.ip(), "Rate limiting client request");
        state.metrics.record_request("storage_rpc", 429);
        return RequestError::RateLimited.into_response();
    }

    if let Err(reason) = snode_ready(&state) {
        debug!(reason = %reason, "Rejecting client request, not ready");
        state.metrics.record_request("storage_rpc", 503);
        return RequestError::NotReady(reason).into_response();
    }

    let ephem_key = headers
        .get(EPHEMKEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let plaintext = match decrypt_client_body(&state, ephem_key.as_deref(), &body) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            let parts = e.to_parts();
            state.metrics.record_request("storage_rpc", parts.0.as_u16());
            return seal(&state, ephem_key.as_deref(), parts);
        }
    };

    let parts = match dispatch_client_rpc(&state, &headers, &plaintext).await {
        Ok(parts) => parts,
        Err(e) => e.to_parts(),
    };
    state.metrics.record_request("storage_rpc", parts.0.as_u16());
    seal(&state, ephem_key.as_deref(), parts)
}

fn decrypt_client_body(
    state: &AppState,
    ephem_key: Option<&str>,
    body: &[u8],
) -> Result<Vec<u8>, RequestError> {
    let Some(key) = ephem_key else {
        return Ok(body.to_vec());
    };
    let decoded = BASE64
        .decode(body)
        .map_err(|_| RequestError::BadRequest("could not base64-decode body".into()))?;
    state
        .channel
        .decrypt(&decoded, key)
        .map_err(|e| RequestError::BadRequest(format!("could not decrypt body: {e}")))
}

/// Encrypt the response for the client's ephemeral key, mirroring the
/// request envelope. Without the header the response goes out in plain.
fn seal(state: &AppState, ephem_key: Option<&str>, parts: Parts) -> Response {
    let (status, body, content_type) = parts;
    match ephem_key {
        None => (status, [("content-type", content_type)], body).into_response(),
        Some(key) => match state.channel.encrypt(body.as_bytes(), key) {
            Ok(sealed) => (
                status,
                [("content-type", "text/plain")],
                BASE64.encode(sealed),
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "Could not encrypt response");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    [("content-type", "text/plain")],
                    "could not encrypt response\n".to_string(),
                )
                    .into_response()
            }
        },
    }
}

async fn dispatch_client_rpc(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    plaintext: &[u8],
) -> Result<Parts, RequestError> {
    let body: serde_json::Value = serde_json::from_slice(plaintext)
        .map_err(|_| RequestError::BadRequest("invalid json".into()))?;
    let method = body
        .get("method")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RequestError::BadRequest("invalid json: no `method` field".into()))?;
    let params = body
        .get("params")
        .filter(|v| v.is_object())
        .cloned()
        .ok_or_else(|| RequestError::BadRequest("invalid json: no `params` field".into()))?;

    trace!(method, "Client RPC");
    match method {
        "store" => process_store_rpc(state, params).await,
        "retrieve" => process_retrieve_rpc(state, headers, params).await,
        "get_snodes_for_pubkey" => process_snodes_rpc(state, params),
        other => Err(RequestError::BadRequest(format!("no method {other}"))),
    }
}

fn parse_user_pubkey(state: &AppState, raw: &str) -> Result<UserPubkey, RequestError> {
    UserPubkey::create(raw, &state.params).ok_or_else(|| {
        RequestError::BadRequest(format!(
            "pubkey must be {} hex characters long",
            state.params.user_pubkey_size
        ))
    })
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoreParams {
    pub_key: String,
    ttl: String,
    nonce: String,
    timestamp: String,
    data: String,
}

async fn process_store_rpc(
    state: &Arc<AppState>,
    params: serde_json::Value,
) -> Result<Parts, RequestError> {
    state
        .stats
        .client_store_requests
        .fetch_add(1, Ordering::Relaxed);

    let params: StoreParams = serde_json::from_value(params)
        .map_err(|e| RequestError::BadRequest(format!("invalid json: {e}")))?;

    let pk = parse_user_pubkey(state, &params.pub_key)?;

    if params.data.len() > MAX_MESSAGE_BODY {
        return Err(RequestError::BadRequest(format!(
            "message body exceeds maximum allowed length of {MAX_MESSAGE_BODY}"
        )));
    }

    {
        let swarm = state.swarm.read();
        if !swarm.is_pubkey_for_us(&pk) {
            debug!(pubkey = %pk, "Store request for a different swarm");
            return Err(RequestError::WrongSwarm(swarm.snodes_for_pubkey(&pk)));
        }
    }

    let ttl_ms: u64 = params.ttl.parse().map_err(|_| RequestError::InvalidTtl)?;
    if !(TTL_MIN_MS..=TTL_MAX_MS).contains(&ttl_ms) {
        return Err(RequestError::InvalidTtl);
    }

    let timestamp_ms: u64 = params
        .timestamp
        .parse()
        .map_err(|_| RequestError::InvalidTimestamp)?;
    let now = common::now_ms();
    if timestamp_ms > now + TIMESTAMP_DRIFT_TOLERANCE_MS
        || timestamp_ms.saturating_add(ttl_ms) <= now
    {
        return Err(RequestError::InvalidTimestamp);
    }

    // The difficulty is served back to the client regardless of outcome.
    let difficulty = state.difficulty.load(Ordering::Relaxed);
    let hash = pow::check_pow(
        &params.nonce,
        timestamp_ms,
        ttl_ms,
        pk.as_str(),
        &params.data,
        difficulty,
    )
    .map_err(|_| {
        state.metrics.pow_rejections.inc();
        state.stats.pow_rejections.fetch_add(1, Ordering::Relaxed);
        debug!(nonce = %params.nonce, "Store rejected for invalid PoW");
        RequestError::InvalidPow(difficulty)
    })?;

    let message = Message {
        pubkey: pk.as_str().to_string(),
        data: params.data,
        hash,
        ttl_ms,
        timestamp_ms,
        nonce: params.nonce,
    };
    service_node::process_store(state, message, true).await?;
    state.metrics.client_stores.inc();
    trace!(pubkey = %pk, "Successfully stored message");

    Ok((
        StatusCode::OK,
        json!({ "difficulty": difficulty }).to_string(),
        "application/json",
    ))
}

fn messages_response(items: &[Message]) -> Parts {
    let messages: Vec<serde_json::Value> = items
        .iter()
        .map(|msg| {
            json!({
                "hash": msg.hash,
                "expiration": msg.expiration_ms(),
                "data": msg.data,
            })
        })
        .collect();
    (
        StatusCode::OK,
        json!({ "messages": messages }).to_string(),
        "application/json",
    )
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RetrieveParams {
    pub_key: String,
    last_hash: String,
}

async fn process_retrieve_rpc(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    params: serde_json::Value,
) -> Result<Parts, RequestError> {
    state
        .stats
        .client_retrieve_requests
        .fetch_add(1, Ordering::Relaxed);

    let params: RetrieveParams = serde_json::from_value(params)
        .map_err(|e| RequestError::BadRequest(format!("invalid json: {e}")))?;
    let pk = parse_user_pubkey(state, &params.pub_key)?;

    {
        let swarm = state.swarm.read();
        if !swarm.is_pubkey_for_us(&pk) {
            return Err(RequestError::WrongSwarm(swarm.snodes_for_pubkey(&pk)));
        }
    }

    let now = common::now_ms();
    let pubkey = pk.as_str().to_string();
    let last_hash = params.last_hash.clone();
    let items = with_store(state, move |store| {
        store.retrieve(&pubkey, &last_hash, now)
    })
    .await?;

    state.metrics.client_retrieves.inc();

    let long_poll = headers.contains_key(LONG_POLL_HEADER);
    if items.is_empty() && long_poll {
        // hold the connection until a matching message arrives or the
        // long-poll window closes; the guard deregisters either way
        let (guard, rx) = state.listeners.register(pk.as_str());
        let outcome = tokio::time::timeout(LONG_POLL_TIMEOUT, rx).await;
        drop(guard);
        let items = match outcome {
            Ok(Ok(message)) => vec![message],
            _ => Vec::new(),
        };
        return Ok(messages_response(&items));
    }

    if !items.is_empty() {
        trace!(pubkey = %pk, count = items.len(), "Successfully retrieved messages");
    }
    Ok(messages_response(&items))
}

fn process_snodes_rpc(
    state: &Arc<AppState>,
    params: serde_json::Value,
) -> Result<Parts, RequestError> {
    let raw = params
        .get("pubKey")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RequestError::BadRequest("invalid json: no `pubKey` field".into()))?;
    let pk = parse_user_pubkey(state, raw)?;
    let snodes = state.swarm.read().snodes_for_pubkey(&pk);
    Ok((
        StatusCode::OK,
        snodes_to_json(&snodes).to_string(),
        "application/json",
    ))
}

// ============================================================================
// Peer endpoints
// ============================================================================

/// Authenticate the signed peer envelope: both headers present, sender is
/// a registered node, signature covers the body, and the per-pubkey
/// bucket has tokens left.
fn validate_snode_request(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<String, RequestError> {
    let mut missing = Vec::new();
    let sender = match headers
        .get(SENDER_SNODE_PUBKEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(sender) => sender,
        None => {
            missing.push(SENDER_SNODE_PUBKEY_HEADER);
            ""
        }
    };
    let signature = match headers
        .get(SNODE_SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        Some(signature) => signature,
        None => {
            missing.push(SNODE_SIGNATURE_HEADER);
            ""
        }
    };
    if !missing.is_empty() {
        return Err(RequestError::Unauthorized(format!(
            "missing header(s): {}",
            missing.join(", ")
        )));
    }

    if !state.swarm.read().is_snode_address_known(sender) {
        debug!(sender = %sender, "Discarding signature from unknown service node");
        return Err(RequestError::Unauthorized("unknown service node".into()));
    }
    if !verify_signature(signature, body, sender) {
        debug!(sender = %sender, "Could not verify request signature");
        return Err(RequestError::Unauthorized(
            "could not verify signature".into(),
        ));
    }
    if state.rate_limiter.should_rate_limit_snode(sender) {
        return Err(RequestError::RateLimited);
    }
    Ok(sender.to_string())
}

/// Finish a peer request: record metrics and attach the certificate
/// signature header.
fn peer_respond(state: &AppState, endpoint: &str, result: Result<Parts, RequestError>) -> Response {
    let (status, body, content_type) = match result {
        Ok(parts) => parts,
        Err(e) => e.to_parts(),
    };
    state.metrics.record_request(endpoint, status.as_u16());
    (
        status,
        [
            ("content-type", content_type),
            (SNODE_SIGNATURE_HEADER, state.identity.cert_signature()),
        ],
        body,
    )
        .into_response()
}

async fn swarm_push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = handle_push(&state, &headers, &body).await;
    peer_respond(&state, "swarms_push", result)
}

async fn handle_push(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Parts, RequestError> {
    validate_snode_request(state, headers, body)?;
    snode_ready(state).map_err(RequestError::NotReady)?;

    let mut messages = codec::deserialize_messages(body)
        .map_err(|e| RequestError::BadRequest(e.to_string()))?;
    if messages.len() != 1 {
        return Err(RequestError::BadRequest(
            "push expects exactly one message".into(),
        ));
    }
    state
        .stats
        .peer_push_requests
        .fetch_add(1, Ordering::Relaxed);
    state.metrics.peer_pushes.inc();
    service_node::process_store(state, messages.remove(0), false).await?;
    Ok((StatusCode::OK, String::new(), "text/plain"))
}

async fn swarm_push_batch(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = handle_push_batch(&state, &headers, &body).await;
    peer_respond(&state, "swarms_push_batch", result)
}

async fn handle_push_batch(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Parts, RequestError> {
    validate_snode_request(state, headers, body)?;
    snode_ready(state).map_err(RequestError::NotReady)?;

    let messages = codec::deserialize_messages(body)
        .map_err(|e| RequestError::BadRequest(e.to_string()))?;
    state
        .stats
        .peer_push_requests
        .fetch_add(1, Ordering::Relaxed);
    state.metrics.peer_pushes.inc_by(messages.len() as u64);
    debug!(count = messages.len(), "Accepting push batch");
    service_node::process_push_batch(state, messages).await?;
    Ok((StatusCode::OK, String::new(), "text/plain"))
}

async fn storage_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = handle_storage_test(&state, &headers, &body).await;
    peer_respond(&state, "swarms_storage_test", result)
}

async fn handle_storage_test(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Parts, RequestError> {
    validate_snode_request(state, headers, body)?;
    snode_ready(state).map_err(RequestError::NotReady)?;

    #[derive(Deserialize)]
    struct Params {
        height: u64,
        hash: String,
    }
    let params: Params = serde_json::from_slice(body)
        .map_err(|_| RequestError::BadRequest("invalid json: missing `height`/`hash`".into()))?;

    let status = service_node::process_storage_test_req(state, params.height, params.hash).await;
    let body = match status {
        MessageTestStatus::Success(data) => json!({ "status": "OK", "value": data }),
        MessageTestStatus::Retry => json!({ "status": "retry" }),
        MessageTestStatus::WrongReq => json!({ "status": "wrong request" }),
        MessageTestStatus::Other => json!({ "status": "other" }),
    };
    Ok((StatusCode::OK, body.to_string(), "application/json"))
}

async fn blockchain_test(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let result = handle_blockchain_test(&state, &headers, &body).await;
    peer_respond(&state, "swarms_blockchain_test", result)
}

async fn handle_blockchain_test(
    state: &Arc<AppState>,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Parts, RequestError> {
    validate_snode_request(state, headers, body)?;
    snode_ready(state).map_err(RequestError::NotReady)?;

    #[derive(Deserialize)]
    struct Params {
        max_height: u64,
        seed: u64,
        #[serde(default)]
        #[allow(dead_code)]
        height: u64,
    }
    let params: Params = serde_json::from_slice(body).map_err(|_| {
        RequestError::BadRequest("invalid json: missing `max_height`/`seed`".into())
    })?;

    let answer = service_node::perform_blockchain_test(
        state,
        BcTestParams {
            max_height: params.max_height,
            seed: params.seed,
        },
    )
    .await
    .map_err(|e| {
        warn!(error = %e, "Blockchain test lookup failed");
        RequestError::NotReady("daemon lookup failed".into())
    })?;

    Ok((
        StatusCode::OK,
        json!({ "res_height": answer.res_height, "res_hash": answer.res_hash }).to_string(),
        "application/json",
    ))
}

/// Liveness probe; deliberately exempt from both the signature check and
/// the readiness gate so peers can see us during warm-up.
async fn ping_test(State(state): State<Arc<AppState>>) -> Response {
    peer_respond(
        &state,
        "swarms_ping_test",
        Ok((StatusCode::OK, String::new(), "text/plain")),
    )
}

// ============================================================================
// Stats, logs, metrics
// ============================================================================

async fn get_stats(State(state): State<Arc<AppState>>) -> Response {
    let total_stored = with_store(&state, |store| store.len()).await.unwrap_or(0);
    let body = json!({
        "version": env!("CARGO_PKG_VERSION"),
        "height": state.height.load(Ordering::SeqCst),
        "block_hash": *state.block_hash.read(),
        "hardfork": state.hardfork.load(Ordering::SeqCst),
        "swarm_id": state.swarm.read().our_swarm_id(),
        "total_stored": total_stored,
        "difficulty": state.difficulty.load(Ordering::Relaxed),
        "client_store_requests": state.stats.client_store_requests.load(Ordering::Relaxed),
        "client_retrieve_requests": state.stats.client_retrieve_requests.load(Ordering::Relaxed),
        "peer_push_requests": state.stats.peer_push_requests.load(Ordering::Relaxed),
        "pow_rejections": state.stats.pow_rejections.load(Ordering::Relaxed),
        "pending_listeners": state.listeners.len(),
        "unreachable_peers": state.reachability.lock().len(),
    });
    state.metrics.record_request("get_stats", 200);
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn get_logs(State(state): State<Arc<AppState>>) -> Response {
    {
        let mut last = state.last_logs_request.lock();
        let now = Instant::now();
        if let Some(previous) = *last {
            if now.duration_since(previous) < LOGS_REQUEST_PERIOD {
                state.metrics.record_request("get_logs", 429);
                return (
                    StatusCode::TOO_MANY_REQUESTS,
                    "too many requests, try again later\n",
                )
                    .into_response();
            }
        }
        *last = Some(now);
    }

    let body = json!({ "entries": state.log_buffer.recent() });
    state.metrics.record_request("get_logs", 200);
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        body.to_string(),
    )
        .into_response()
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> Response {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        state.metrics.encode(),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service_node::tests::test_state;
    use common::SwarmInfo;

    fn make_ready(state: &Arc<AppState>) {
        state.refreshed_once.store(true, Ordering::SeqCst);
        let our = state.swarm.read().our_address().clone();
        let snapshot = vec![SwarmInfo {
            swarm_id: 1,
            snodes: vec![our],
        }];
        let events = state.swarm.read().derive_swarm_events(&snapshot);
        state.swarm.write().update_state(snapshot, vec![], &events);
    }

    #[tokio::test]
    async fn test_unsigned_peer_request_is_unauthorized() {
        let (_dir, state) = test_state();
        make_ready(&state);
        let headers = HeaderMap::new();
        let err = handle_push(&state, &headers, b"body").await.unwrap_err();
        assert!(matches!(err, RequestError::Unauthorized(_)));
        // and the error names both missing headers
        let msg = err.to_string();
        assert!(msg.contains(SENDER_SNODE_PUBKEY_HEADER));
        assert!(msg.contains(SNODE_SIGNATURE_HEADER));
    }

    #[tokio::test]
    async fn test_unknown_sender_is_unauthorized() {
        let (_dir, state) = test_state();
        make_ready(&state);
        let mut headers = HeaderMap::new();
        headers.insert(
            SENDER_SNODE_PUBKEY_HEADER,
            "y".repeat(52).parse().unwrap(),
        );
        headers.insert(SNODE_SIGNATURE_HEADER, "c2ln".parse().unwrap());
        let err = handle_push(&state, &headers, b"body").await.unwrap_err();
        assert!(matches!(err, RequestError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_store_round_trips_through_retrieve() {
        let (_dir, state) = test_state();
        make_ready(&state);

        let pk = "aa".repeat(32);
        let now = common::now_ms();
        let params = json!({
            "pubKey": pk,
            "ttl": "60000",
            "timestamp": now.to_string(),
            "nonce": "0000",
            "data": "hello",
        });
        // difficulty 1 makes any nonce valid
        state.difficulty.store(1, Ordering::Relaxed);
        let (status, body, _) = process_store_rpc(&state, params).await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "difficulty": 1 }).to_string());

        let (status, body, _) = process_retrieve_rpc(
            &state,
            &HeaderMap::new(),
            json!({ "pubKey": pk, "lastHash": "" }),
        )
        .await
        .unwrap();
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["messages"][0]["data"], "hello");
    }

    #[tokio::test]
    async fn test_store_validations() {
        let (_dir, state) = test_state();
        make_ready(&state);
        let pk = "aa".repeat(32);
        let now = common::now_ms();

        // bad ttl
        let params = json!({
            "pubKey": pk, "ttl": "50", "timestamp": now.to_string(),
            "nonce": "0000", "data": "hello",
        });
        assert!(matches!(
            process_store_rpc(&state, params).await.unwrap_err(),
            RequestError::InvalidTtl
        ));

        // timestamp far in the future
        let params = json!({
            "pubKey": pk, "ttl": "60000",
            "timestamp": (now + 60_000).to_string(),
            "nonce": "0000", "data": "hello",
        });
        assert!(matches!(
            process_store_rpc(&state, params).await.unwrap_err(),
            RequestError::InvalidTimestamp
        ));

        // oversized body
        let params = json!({
            "pubKey": pk, "ttl": "60000", "timestamp": now.to_string(),
            "nonce": "0000", "data": "x".repeat(MAX_MESSAGE_BODY + 1),
        });
        assert!(matches!(
            process_store_rpc(&state, params).await.unwrap_err(),
            RequestError::BadRequest(_)
        ));
    }

    #[tokio::test]
    async fn test_pow_rejection_reports_difficulty() {
        let (_dir, state) = test_state();
        make_ready(&state);
        state.difficulty.store(u64::MAX, Ordering::Relaxed);
        let params = json!({
            "pubKey": "aa".repeat(32),
            "ttl": "1209600000",
            "timestamp": common::now_ms().to_string(),
            "nonce": "0".repeat(16),
            "data": "x".repeat(3000),
        });
        let err = process_store_rpc(&state, params).await.unwrap_err();
        match err {
            RequestError::InvalidPow(difficulty) => assert_eq!(difficulty, u64::MAX),
            other => panic!("expected InvalidPow, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wrong_swarm_redirect_carries_members() {
        let (_dir, state) = test_state();
        state.refreshed_once.store(true, Ordering::SeqCst);

        // two swarms; we sit near the bottom of the ring, the target near
        // the top
        let our = state.swarm.read().our_address().clone();
        let other_pk = hex::encode([5u8; 32]);
        let other =
            SnodeRecord::new(&other_pk, &other_pk, &other_pk, "10.0.0.5", 22025).unwrap();
        let snapshot = vec![
            SwarmInfo {
                swarm_id: 0,
                snodes: vec![our],
            },
            SwarmInfo {
                swarm_id: u64::MAX - 1,
                snodes: vec![other.clone()],
            },
        ];
        let events = state.swarm.read().derive_swarm_events(&snapshot);
        state.swarm.write().update_state(snapshot, vec![], &events);

        // a pubkey whose low bits sit exactly on the top swarm id
        let params = json!({
            "pubKey": format!("{}fe", "ff".repeat(31)),
            "ttl": "60000",
            "timestamp": common::now_ms().to_string(),
            "nonce": "0000",
            "data": "hello",
        });
        let err = process_store_rpc(&state, params).await.unwrap_err();
        match err {
            RequestError::WrongSwarm(snodes) => {
                assert_eq!(snodes, vec![other]);
            }
            other => panic!("expected WrongSwarm, got {other:?}"),
        }
        let (_, body, _) = RequestError::WrongSwarm(vec![]).to_parts();
        assert!(body.contains("snodes"));
    }

    #[tokio::test]
    async fn test_long_poll_wakes_on_store() {
        let (_dir, state) = test_state();
        make_ready(&state);
        state.difficulty.store(1, Ordering::Relaxed);

        let pk = "aa".repeat(32);
        let mut headers = HeaderMap::new();
        headers.insert(LONG_POLL_HEADER, "1".parse().unwrap());

        let poll_state = Arc::clone(&state);
        let poll_pk = pk.clone();
        let poller = tokio::spawn(async move {
            process_retrieve_rpc(
                &poll_state,
                &headers,
                json!({ "pubKey": poll_pk, "lastHash": "" }),
            )
            .await
        });

        // give the poller time to register its listener
        tokio::time::sleep(Duration::from_millis(100)).await;

        let params = json!({
            "pubKey": pk,
            "ttl": "60000",
            "timestamp": common::now_ms().to_string(),
            "nonce": "0000",
            "data": "wake up",
        });
        process_store_rpc(&state, params).await.unwrap();

        let (status, body, _) = poller.await.unwrap().unwrap();
        assert_eq!(status, StatusCode::OK);
        let parsed: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(parsed["messages"][0]["data"], "wake up");
    }
}
