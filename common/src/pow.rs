//! Client proof-of-work, the spam gate on message stores.
//!
//! The message hash doubles as the PoW commitment: it binds the nonce to
//! the full message content, so a valid nonce cannot be reused for a
//! different payload, recipient or TTL. Difficulty scales with TTL and
//! inversely with payload size, making long-lived spam expensive.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha2::{Digest, Sha512};
use thiserror::Error;

/// Difficulty served to clients until the operator overrides it.
pub const DEFAULT_DIFFICULTY: u64 = 100;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PowError {
    #[error("nonce does not satisfy the current difficulty")]
    InsufficientWork,
}

fn payload(ttl_ms: u64, timestamp_ms: u64, pubkey: &str, data: &str) -> String {
    format!("{ttl_ms}{timestamp_ms}{pubkey}{data}")
}

fn digest_of(payload: &str, nonce: &str) -> [u8; 64] {
    let mut hasher = Sha512::new();
    hasher.update(BASE64.encode(payload).as_bytes());
    hasher.update(nonce.as_bytes());
    hasher.finalize().into()
}

/// Hash identity of a message: hex SHA-512 over the base64 of
/// `ttl || timestamp || pubkey || data`, with the nonce appended.
pub fn message_hash(
    ttl_ms: u64,
    timestamp_ms: u64,
    pubkey: &str,
    data: &str,
    nonce: &str,
) -> String {
    hex::encode(digest_of(&payload(ttl_ms, timestamp_ms, pubkey, data), nonce))
}

/// Verify the PoW nonce and return the message hash on success.
///
/// The top 8 digest bytes, read big-endian as `t`, must satisfy
/// `t * ttl_secs * difficulty <= 2^64 * payload_len`.
pub fn check_pow(
    nonce: &str,
    timestamp_ms: u64,
    ttl_ms: u64,
    pubkey: &str,
    data: &str,
    difficulty: u64,
) -> Result<String, PowError> {
    let payload = payload(ttl_ms, timestamp_ms, pubkey, data);
    let digest = digest_of(&payload, nonce);

    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    let t = u64::from_be_bytes(head) as u128;

    let ttl_secs = (ttl_ms / 1000).max(1) as u128;
    let target = (1u128 << 64) * payload.len() as u128;

    let work = t
        .saturating_mul(ttl_secs)
        .saturating_mul(difficulty as u128);
    if work > target {
        return Err(PowError::InsufficientWork);
    }
    Ok(hex::encode(digest))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PK: &str = "aabbccddeeff00112233445566778899aabbccddeeff00112233445566778899";

    #[test]
    fn test_hash_is_stable_and_content_bound() {
        let h = message_hash(60_000, 1_700_000_000_000, PK, "hello", "abcd");
        assert_eq!(h.len(), 128);
        assert_eq!(h, message_hash(60_000, 1_700_000_000_000, PK, "hello", "abcd"));
        assert_ne!(h, message_hash(60_000, 1_700_000_000_000, PK, "hello!", "abcd"));
        assert_ne!(h, message_hash(60_001, 1_700_000_000_000, PK, "hello", "abcd"));
        assert_ne!(h, message_hash(60_000, 1_700_000_000_000, PK, "hello", "abce"));
    }

    #[test]
    fn test_trivial_difficulty_always_passes() {
        // With difficulty 1 and a 1 s TTL the target always exceeds t.
        let hash = check_pow("0000", 1_700_000_000_000, 1000, PK, "hello", 1).unwrap();
        assert_eq!(hash, message_hash(1000, 1_700_000_000_000, PK, "hello", "0000"));
    }

    #[test]
    fn test_extreme_difficulty_rejects() {
        let res = check_pow(
            "0000000000000000",
            1_700_000_000_000,
            14 * 24 * 60 * 60 * 1000,
            PK,
            &"x".repeat(3000),
            u64::MAX,
        );
        assert_eq!(res, Err(PowError::InsufficientWork));
    }
}
