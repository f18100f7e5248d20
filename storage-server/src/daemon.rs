//! JSON-RPC 2.0 client for the local chain daemon.
//!
//! The daemon is the source of truth for the registered node list, block
//! hashes and our own key material. Failures here are expected during
//! daemon restarts; callers retry on their next tick and never surface
//! daemon errors to clients other than as 503.

use common::{BlockUpdate, SnodeRecord, SwarmInfo};
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Delay between retries while waiting for our private keys at startup.
const PRIVKEY_RETRY_PERIOD: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("daemon returned an error: {0}")]
    Rpc(String),
    #[error("unexpected daemon response: {0}")]
    BadResponse(String),
}

#[derive(Clone)]
pub struct DaemonClient {
    http: reqwest::Client,
    url: String,
}

#[derive(Deserialize)]
struct ServiceNodeState {
    service_node_pubkey: String,
    #[serde(default)]
    pubkey_ed25519: String,
    #[serde(default)]
    pubkey_x25519: String,
    #[serde(default)]
    public_ip: String,
    #[serde(default)]
    storage_port: u16,
    #[serde(default)]
    swarm_id: u64,
    #[serde(default)]
    funded: bool,
    #[serde(default)]
    active: bool,
}

impl DaemonClient {
    pub fn new(rpc_ip: &str, rpc_port: u16) -> Self {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .expect("failed to build daemon HTTP client");
        Self {
            http,
            url: format!("http://{rpc_ip}:{rpc_port}/json_rpc"),
        }
    }

    async fn call(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<serde_json::Value, DaemonError> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "0",
            "method": method,
            "params": params,
        });
        let response = self.http.post(&self.url).json(&body).send().await?;
        let value: serde_json::Value = response.json().await?;
        if let Some(err) = value.get("error") {
            return Err(DaemonError::Rpc(err.to_string()));
        }
        value
            .get("result")
            .cloned()
            .ok_or_else(|| DaemonError::BadResponse("missing `result` field".into()))
    }

    /// Fetch our three private keys, retrying until the daemon answers.
    /// Startup cannot proceed without them.
    pub async fn get_privkeys_with_retry(&self) -> (String, String, String) {
        loop {
            match self.get_privkeys().await {
                Ok(keys) => return keys,
                Err(e) => {
                    error!(
                        url = %self.url,
                        error = %e,
                        "Error retrieving service node keys from the daemon. \
                         Is it running? Retrying in 5s"
                    );
                    tokio::time::sleep(PRIVKEY_RETRY_PERIOD).await;
                }
            }
        }
    }

    async fn get_privkeys(&self) -> Result<(String, String, String), DaemonError> {
        let result = self.call("get_service_node_privkey", json!({})).await?;
        let field = |name: &str| -> Result<String, DaemonError> {
            result
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| DaemonError::BadResponse(format!("missing `{name}`")))
        };
        let legacy = field("service_node_privkey")?;
        let ed25519 = field("service_node_ed25519_privkey")?;
        let x25519 = field("service_node_x25519_privkey")?;
        for key in [&legacy, &x25519] {
            if key.len() != 64 || !key.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(DaemonError::BadResponse("privkey is not 32-byte hex".into()));
            }
        }
        Ok((legacy, ed25519, x25519))
    }

    /// Fetch the registered node list and fold it into a snapshot.
    pub async fn get_service_nodes(&self) -> Result<BlockUpdate, DaemonError> {
        let result = self
            .call(
                "get_n_service_nodes",
                json!({
                    "fields": {
                        "service_node_pubkey": true,
                        "pubkey_ed25519": true,
                        "pubkey_x25519": true,
                        "public_ip": true,
                        "storage_port": true,
                        "swarm_id": true,
                        "funded": true,
                        "active": true,
                    }
                }),
            )
            .await?;

        let height = result
            .get("height")
            .and_then(|v| v.as_u64())
            .ok_or_else(|| DaemonError::BadResponse("missing `height`".into()))?;
        let block_hash = result
            .get("block_hash")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let hardfork = result
            .get("hardfork")
            .and_then(|v| v.as_u64())
            .unwrap_or_default() as u32;

        let states: Vec<ServiceNodeState> = serde_json::from_value(
            result
                .get("service_node_states")
                .cloned()
                .ok_or_else(|| DaemonError::BadResponse("missing `service_node_states`".into()))?,
        )
        .map_err(|e| DaemonError::BadResponse(e.to_string()))?;

        let mut swarms: BTreeMap<u64, Vec<SnodeRecord>> = BTreeMap::new();
        let mut decommissioned = Vec::new();
        for state in states {
            if !state.funded {
                continue;
            }
            let record = match SnodeRecord::new(
                &state.service_node_pubkey,
                &state.pubkey_ed25519,
                &state.pubkey_x25519,
                &state.public_ip,
                state.storage_port,
            ) {
                Ok(record) => record,
                Err(e) => {
                    warn!(
                        pubkey = %state.service_node_pubkey,
                        error = %e,
                        "Skipping malformed service node record"
                    );
                    continue;
                }
            };
            if state.active {
                swarms.entry(state.swarm_id).or_default().push(record);
            } else {
                decommissioned.push(record);
            }
        }

        Ok(BlockUpdate {
            swarms: swarms
                .into_iter()
                .map(|(swarm_id, snodes)| SwarmInfo { swarm_id, snodes })
                .collect(),
            decommissioned,
            height,
            block_hash,
            hardfork,
        })
    }

    /// Hash of the block at `height`, for blockchain tests.
    pub async fn get_block_hash(&self, height: u64) -> Result<String, DaemonError> {
        let result = self.call("get_block_hash", json!({ "height": height })).await?;
        result
            .get("hash")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| DaemonError::BadResponse("missing `hash`".into()))
    }

    /// Tell the daemon our storage server is alive.
    pub async fn storage_server_ping(&self, version: &str) -> Result<(), DaemonError> {
        self.call("storage_server_ping", json!({ "version": version }))
            .await
            .map(|_| ())
    }

    /// Submit a deregistration vote for a peer that stayed unreachable
    /// beyond the grace period.
    pub async fn report_unreachable_peer(&self, pubkey_hex: &str) -> Result<(), DaemonError> {
        self.call(
            "report_unreachable_service_node",
            json!({ "pubkey": pubkey_hex }),
        )
        .await
        .map(|_| ())
    }
}
