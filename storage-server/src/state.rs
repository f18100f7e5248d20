//! Shared application state for HTTP handlers and background loops.

use crate::channel::ChannelCipher;
use crate::daemon::DaemonClient;
use crate::identity::IdentityKeys;
use crate::listeners::ListenerRegistry;
use crate::logbuf::LogBuffer;
use crate::metrics::Metrics;
use crate::rate_limit::RateLimiter;
use crate::reachability::ReachabilityLedger;
use crate::store::MessageStore;
use crate::swarm::Swarm;
use common::NetworkParams;
use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Deadline shared by the server and the outbound peer client.
pub const SESSION_TIME_LIMIT: Duration = Duration::from_secs(60);

/// Plain counters behind `/get_stats/v1`.
#[derive(Default)]
pub struct Stats {
    pub client_store_requests: AtomicU64,
    pub client_retrieve_requests: AtomicU64,
    pub peer_push_requests: AtomicU64,
    pub pow_rejections: AtomicU64,
}

pub struct AppState {
    pub params: NetworkParams,
    pub identity: Arc<IdentityKeys>,
    pub channel: ChannelCipher,
    pub daemon: DaemonClient,
    pub store: Arc<MessageStore>,
    /// Swarm topology; mutated only by the refresh loop, readers take the
    /// lock briefly and clone what they need. No await happens under it.
    pub swarm: RwLock<Swarm>,
    pub reachability: Mutex<ReachabilityLedger>,
    pub listeners: Arc<ListenerRegistry>,
    pub rate_limiter: RateLimiter,
    /// Pooled client for peer requests. Peer certs are self-signed; their
    /// identity is pinned via the signed response header instead.
    pub peer_http: reqwest::Client,
    pub metrics: Metrics,
    pub stats: Stats,
    pub log_buffer: Arc<LogBuffer>,
    pub height: AtomicU64,
    pub hardfork: AtomicU32,
    pub block_hash: RwLock<String>,
    /// Set after the first successful chain refresh; part of the readiness
    /// gate.
    pub refreshed_once: AtomicBool,
    pub force_start: bool,
    /// Current PoW difficulty served to clients.
    pub difficulty: AtomicU64,
    /// `/get_logs/v1` throttle (1 request per second).
    pub last_logs_request: Mutex<Option<Instant>>,
}

impl AppState {
    pub fn build_peer_client() -> reqwest::Client {
        reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .timeout(SESSION_TIME_LIMIT)
            .danger_accept_invalid_certs(true)
            .build()
            .expect("failed to build peer HTTP client")
    }

    pub fn new(
        params: NetworkParams,
        identity: Arc<IdentityKeys>,
        daemon: DaemonClient,
        store: Arc<MessageStore>,
        swarm: Swarm,
        force_start: bool,
    ) -> Self {
        Self::with_log_buffer(
            params,
            identity,
            daemon,
            store,
            swarm,
            force_start,
            Arc::new(LogBuffer::new()),
        )
    }

    pub fn with_log_buffer(
        params: NetworkParams,
        identity: Arc<IdentityKeys>,
        daemon: DaemonClient,
        store: Arc<MessageStore>,
        swarm: Swarm,
        force_start: bool,
        log_buffer: Arc<LogBuffer>,
    ) -> Self {
        let channel = ChannelCipher::new(identity.x25519_secret().clone());
        Self {
            params,
            identity,
            channel,
            daemon,
            store,
            swarm: RwLock::new(swarm),
            reachability: Mutex::new(ReachabilityLedger::new()),
            listeners: Arc::new(ListenerRegistry::new()),
            rate_limiter: RateLimiter::new(),
            peer_http: Self::build_peer_client(),
            metrics: Metrics::new(),
            stats: Stats::default(),
            log_buffer,
            height: AtomicU64::new(0),
            hardfork: AtomicU32::new(0),
            block_hash: RwLock::new(String::new()),
            refreshed_once: AtomicBool::new(false),
            force_start,
            difficulty: AtomicU64::new(common::pow::DEFAULT_DIFFICULTY),
            last_logs_request: Mutex::new(None),
        }
    }
}
