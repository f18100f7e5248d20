//! Common types and algorithms for the service node storage server.
//!
//! This crate provides the domain model shared between the server binary and
//! the property-test suite:
//! - **Service node records**: on-chain identity of a registered node
//! - **Swarm snapshots**: per-block swarm composition reported by the daemon
//! - **Ring mapping**: deterministic user-pubkey -> swarm assignment
//! - **Messages**: the stored unit, plus the binary wire framing used for
//!   intra-swarm replication
//! - **Proof of work**: the spam gate checked on client stores
//! - **base32z**: the address encoding used for `.snode` hostnames
//! - **TLS configuration**: certificate loading with self-signed fallback
//!
//! # Swarm Assignment Overview
//!
//! Every user pubkey maps to exactly one swarm. The low 64 bits of the
//! pubkey and the 64-bit swarm ids live on the same circular ring; a pubkey
//! belongs to the swarm minimizing the circular distance. The mapping is a
//! pure function of the snapshot, so all nodes agree on message placement
//! without any coordination.

pub mod base32z;
pub mod codec;
pub mod pow;
pub mod tls;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::{SystemTime, UNIX_EPOCH};

// ============================================================================
// Network parameters
// ============================================================================

/// Which chain the node serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Network {
    Mainnet,
    Stagenet,
}

/// Network-dependent constants, constructed once at startup and threaded
/// through instead of a process-wide singleton.
#[derive(Debug, Clone, Copy)]
pub struct NetworkParams {
    pub network: Network,
    /// Hex length of a client (user) pubkey.
    pub user_pubkey_size: usize,
    /// Default RPC port of the local chain daemon.
    pub default_daemon_rpc_port: u16,
}

impl NetworkParams {
    pub fn new(network: Network) -> Self {
        match network {
            Network::Mainnet => Self {
                network,
                user_pubkey_size: 64,
                default_daemon_rpc_port: 19994,
            },
            Network::Stagenet => Self {
                network,
                user_pubkey_size: 64,
                default_daemon_rpc_port: 39994,
            },
        }
    }

    pub fn is_mainnet(&self) -> bool {
        self.network == Network::Mainnet
    }
}

// ============================================================================
// Service node records
// ============================================================================

/// Hex length of a 32-byte key.
pub const KEY_HEX_LEN: usize = 64;

/// A registered service node as reported by the chain daemon.
///
/// Identity is the legacy public key: two records with the same legacy key
/// refer to the same node even if its IP or port changed between snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnodeRecord {
    /// Legacy public key, hex encoded (the node's on-chain identity).
    pub pubkey_hex: String,
    /// Ed25519 public key, hex encoded.
    pub pubkey_ed25519_hex: String,
    /// X25519 public key, hex encoded.
    pub pubkey_x25519_hex: String,
    /// base32z form of the legacy key plus the `.snode` suffix.
    pub address: String,
    /// Public IPv4 address.
    pub ip: String,
    /// Storage server port.
    pub port: u16,
}

impl SnodeRecord {
    /// Build a record from daemon-reported fields, deriving the `.snode`
    /// address from the legacy key. Fails on malformed keys.
    pub fn new(
        pubkey_hex: &str,
        pubkey_ed25519_hex: &str,
        pubkey_x25519_hex: &str,
        ip: &str,
        port: u16,
    ) -> Result<Self, RecordError> {
        let raw = decode_key_hex(pubkey_hex)?;
        let address = format!("{}.snode", base32z::encode(&raw));
        Ok(Self {
            pubkey_hex: pubkey_hex.to_string(),
            pubkey_ed25519_hex: pubkey_ed25519_hex.to_string(),
            pubkey_x25519_hex: pubkey_x25519_hex.to_string(),
            address,
            ip: ip.to_string(),
            port,
        })
    }

    /// The base32z address without the `.snode` suffix.
    pub fn base32z_pubkey(&self) -> &str {
        self.address.trim_end_matches(".snode")
    }
}

impl PartialEq for SnodeRecord {
    fn eq(&self, other: &Self) -> bool {
        self.pubkey_hex == other.pubkey_hex
    }
}

impl Eq for SnodeRecord {}

impl Hash for SnodeRecord {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.pubkey_hex.hash(state);
    }
}

impl fmt::Display for SnodeRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Errors constructing a [`SnodeRecord`].
#[derive(Debug, thiserror::Error)]
pub enum RecordError {
    #[error("key must be {KEY_HEX_LEN} hex characters, got {0}")]
    BadKeyLength(usize),
    #[error("key is not valid hex")]
    BadKeyEncoding,
}

fn decode_key_hex(key: &str) -> Result<[u8; 32], RecordError> {
    if key.len() != KEY_HEX_LEN {
        return Err(RecordError::BadKeyLength(key.len()));
    }
    let bytes = hex::decode(key).map_err(|_| RecordError::BadKeyEncoding)?;
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}

// ============================================================================
// User pubkeys
// ============================================================================

/// A validated client pubkey (opaque fixed-length hex).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserPubkey(String);

impl UserPubkey {
    /// Validate and wrap a raw pubkey string. Length is network-dependent.
    pub fn create(pk: &str, params: &NetworkParams) -> Option<Self> {
        if pk.len() != params.user_pubkey_size {
            return None;
        }
        if !pk.bytes().all(|c| c.is_ascii_hexdigit()) {
            return None;
        }
        Some(Self(pk.to_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Low 64 bits of the pubkey interpreted as a 256-bit big-endian
    /// integer, i.e. the position of this key on the swarm ring.
    pub fn ring_position(&self) -> u64 {
        let tail = &self.0[self.0.len() - 16..];
        u64::from_str_radix(tail, 16).unwrap_or(0)
    }
}

impl fmt::Display for UserPubkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log full client pubkeys
        write!(f, "{}...{}", &self.0[..2], &self.0[self.0.len() - 3..])
    }
}

// ============================================================================
// Messages
// ============================================================================

/// A stored message, as received from a client or replicated from a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Recipient pubkey (validated hex).
    pub pubkey: String,
    /// Opaque payload, exactly as submitted.
    pub data: String,
    /// Unique hash derived from all other fields during the PoW check.
    pub hash: String,
    /// Time to live in milliseconds.
    pub ttl_ms: u64,
    /// Client-supplied creation time, unix milliseconds.
    pub timestamp_ms: u64,
    /// PoW nonce.
    pub nonce: String,
}

impl Message {
    /// A message is retained while `timestamp + ttl > now`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.timestamp_ms.saturating_add(self.ttl_ms) <= now_ms
    }

    pub fn expiration_ms(&self) -> u64 {
        self.timestamp_ms.saturating_add(self.ttl_ms)
    }
}

// ============================================================================
// Swarm snapshots
// ============================================================================

pub type SwarmId = u64;

/// Reserved id meaning "no swarm assigned".
pub const INVALID_SWARM_ID: SwarmId = u64::MAX;

/// One swarm in a chain snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwarmInfo {
    pub swarm_id: SwarmId,
    pub snodes: Vec<SnodeRecord>,
}

/// A full chain snapshot as assembled from one daemon query.
#[derive(Debug, Clone, Default)]
pub struct BlockUpdate {
    pub swarms: Vec<SwarmInfo>,
    /// Registered but non-serving nodes (still part of the funded pool).
    pub decommissioned: Vec<SnodeRecord>,
    pub height: u64,
    pub block_hash: String,
    pub hardfork: u32,
}

/// Diff between two consecutive snapshots, from the local node's viewpoint.
#[derive(Debug, Clone)]
pub struct SwarmEvents {
    /// Our (potentially new) swarm id.
    pub our_swarm_id: SwarmId,
    /// Whether our previous swarm no longer exists and its data must be
    /// redistributed.
    pub dissolved: bool,
    /// Swarms that did not exist in the previous snapshot.
    pub new_swarms: Vec<SwarmId>,
    /// Peers that joined our swarm since the previous snapshot.
    pub new_snodes: Vec<SnodeRecord>,
    /// Current members of our swarm, self excluded.
    pub our_swarm_members: Vec<SnodeRecord>,
}

impl Default for SwarmEvents {
    fn default() -> Self {
        Self {
            our_swarm_id: INVALID_SWARM_ID,
            dissolved: false,
            new_swarms: Vec::new(),
            new_snodes: Vec::new(),
            our_swarm_members: Vec::new(),
        }
    }
}

// ============================================================================
// Ring mapping
// ============================================================================

/// Circular distance between two points on the 64-bit ring.
fn ring_distance(a: u64, b: u64) -> u64 {
    let d = a ^ b;
    d.min(d.wrapping_neg())
}

/// Map a user pubkey to the swarm responsible for it.
///
/// Deterministic and invariant under permutation of `swarms`; ties are
/// broken towards the smaller swarm id. Returns [`INVALID_SWARM_ID`] when
/// the snapshot is empty.
pub fn swarm_for_pubkey(swarms: &[SwarmInfo], pk: &UserPubkey) -> SwarmId {
    let pos = pk.ring_position();
    let mut best: Option<(u64, SwarmId)> = None;
    for swarm in swarms {
        let candidate = (ring_distance(pos, swarm.swarm_id), swarm.swarm_id);
        best = match best {
            Some(cur) if cur <= candidate => Some(cur),
            _ => Some(candidate),
        };
    }
    best.map(|(_, id)| id).unwrap_or(INVALID_SWARM_ID)
}

// ============================================================================
// Time helpers
// ============================================================================

/// Current unix time in milliseconds.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Current unix time in seconds.
pub fn now_secs() -> u64 {
    now_ms() / 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params() -> NetworkParams {
        NetworkParams::new(Network::Mainnet)
    }

    fn record(pk_byte: u8) -> SnodeRecord {
        let pk = hex::encode([pk_byte; 32]);
        SnodeRecord::new(&pk, &pk, &pk, "1.2.3.4", 8080).unwrap()
    }

    #[test]
    fn test_record_identity_is_legacy_pubkey() {
        let mut a = record(1);
        let b = record(1);
        a.ip = "5.6.7.8".to_string();
        a.port = 9999;
        assert_eq!(a, b);
        assert_ne!(record(1), record(2));
    }

    #[test]
    fn test_record_address_shape() {
        let r = record(7);
        assert!(r.address.ends_with(".snode"));
        assert_eq!(r.base32z_pubkey().len(), 52);
    }

    #[test]
    fn test_user_pubkey_validation() {
        let p = params();
        assert!(UserPubkey::create(&"a".repeat(64), &p).is_some());
        assert!(UserPubkey::create(&"a".repeat(63), &p).is_none());
        assert!(UserPubkey::create(&"g".repeat(64), &p).is_none());
    }

    #[test]
    fn test_ring_position_uses_low_64_bits() {
        let p = params();
        let pk = format!("{}00000000000000ff", "0".repeat(48));
        let pk = UserPubkey::create(&pk, &p).unwrap();
        assert_eq!(pk.ring_position(), 0xff);
    }

    #[test]
    fn test_swarm_mapping_empty_snapshot() {
        let p = params();
        let pk = UserPubkey::create(&"a".repeat(64), &p).unwrap();
        assert_eq!(swarm_for_pubkey(&[], &pk), INVALID_SWARM_ID);
    }

    #[test]
    fn test_swarm_mapping_prefers_nearest() {
        let p = params();
        // position 0x10, so swarm 0x10 is at distance 0
        let pk = format!("{}0000000000000010", "0".repeat(48));
        let pk = UserPubkey::create(&pk, &p).unwrap();
        let swarms = vec![
            SwarmInfo {
                swarm_id: 0x8000_0000_0000_0000,
                snodes: vec![],
            },
            SwarmInfo {
                swarm_id: 0x10,
                snodes: vec![],
            },
        ];
        assert_eq!(swarm_for_pubkey(&swarms, &pk), 0x10);
    }

    #[test]
    fn test_message_expiry() {
        let msg = Message {
            pubkey: "a".repeat(64),
            data: "x".into(),
            hash: "h".into(),
            ttl_ms: 1000,
            timestamp_ms: 10_000,
            nonce: String::new(),
        };
        assert!(!msg.is_expired(10_500));
        assert!(msg.is_expired(11_000));
        assert_eq!(msg.expiration_ms(), 11_000);
    }
}
