//! Node identity and inter-node request signing.
//!
//! The three keypairs (legacy, Ed25519, X25519) are fetched from the chain
//! daemon once at startup and never change while the process runs. Envelope
//! signatures on peer requests use the legacy keypair; the X25519 key backs
//! the client channel cipher.

use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use common::{base32z, SnodeRecord};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha512};
use std::sync::OnceLock;
use x25519_dalek::StaticSecret;

/// Header carrying the sender's legacy pubkey in base32z.
pub const SENDER_SNODE_PUBKEY_HEADER: &str = "X-Sender-SNode-PubKey";
/// Header carrying the detached signature over the request body.
pub const SNODE_SIGNATURE_HEADER: &str = "X-SNode-Signature";

pub struct IdentityKeys {
    legacy: SigningKey,
    ed25519: SigningKey,
    x25519: StaticSecret,
    /// base32z of the legacy public key (the address without `.snode`).
    address_b32z: String,
    /// One-shot signature over the TLS certificate, set after the cert is
    /// loaded and attached to every peer-facing response.
    cert_signature: OnceLock<String>,
}

fn key_from_hex(hex_key: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(hex_key).context("private key is not valid hex")?;
    bytes
        .try_into()
        .map_err(|_| anyhow!("private key must be 32 bytes"))
}

impl IdentityKeys {
    pub fn from_hex(legacy_hex: &str, ed25519_hex: &str, x25519_hex: &str) -> Result<Self> {
        let legacy = SigningKey::from_bytes(&key_from_hex(legacy_hex)?);
        // The daemon reports the ed25519 key as a 64-byte seed+public pair.
        let ed_bytes = hex::decode(ed25519_hex).context("ed25519 key is not valid hex")?;
        if ed_bytes.len() != 32 && ed_bytes.len() != 64 {
            return Err(anyhow!("ed25519 private key must be 32 or 64 bytes"));
        }
        let mut seed = [0u8; 32];
        seed.copy_from_slice(&ed_bytes[..32]);
        let ed25519 = SigningKey::from_bytes(&seed);
        let x25519 = StaticSecret::from(key_from_hex(x25519_hex)?);

        let address_b32z = base32z::encode(legacy.verifying_key().as_bytes());

        Ok(Self {
            legacy,
            ed25519,
            x25519,
            address_b32z,
            cert_signature: OnceLock::new(),
        })
    }

    /// Hex of the legacy public key, our on-chain identity.
    pub fn pubkey_hex(&self) -> String {
        hex::encode(self.legacy.verifying_key().as_bytes())
    }

    pub fn pubkey_ed25519_hex(&self) -> String {
        hex::encode(self.ed25519.verifying_key().as_bytes())
    }

    pub fn pubkey_x25519_hex(&self) -> String {
        hex::encode(x25519_dalek::PublicKey::from(&self.x25519).as_bytes())
    }

    /// base32z of the legacy pubkey, sent in the sender header.
    pub fn address_b32z(&self) -> &str {
        &self.address_b32z
    }

    pub fn x25519_secret(&self) -> &StaticSecret {
        &self.x25519
    }

    /// Our own record as peers see it.
    pub fn our_record(&self, ip: &str, port: u16) -> Result<SnodeRecord> {
        SnodeRecord::new(
            &self.pubkey_hex(),
            &self.pubkey_ed25519_hex(),
            &self.pubkey_x25519_hex(),
            ip,
            port,
        )
        .map_err(|e| anyhow!("could not build our own record: {e}"))
    }

    /// Detached signature over `SHA-512(body)`, base64 encoded.
    pub fn sign(&self, body: &[u8]) -> String {
        let digest: [u8; 64] = Sha512::digest(body).into();
        BASE64.encode(self.legacy.sign(&digest).to_bytes())
    }

    /// Sign and cache the TLS certificate digest. Called once at startup.
    pub fn set_cert_signature(&self, cert_pem: &[u8]) {
        let _ = self.cert_signature.set(self.sign(cert_pem));
    }

    /// The cached certificate signature attached to peer responses.
    pub fn cert_signature(&self) -> &str {
        self.cert_signature
            .get()
            .map(String::as_str)
            .expect("cert signature not initialized - call set_cert_signature() during startup")
    }
}

/// Verify a detached envelope signature against the sender's base32z
/// pubkey. Any decoding failure counts as an invalid signature.
pub fn verify_signature(signature_b64: &str, body: &[u8], sender_b32z: &str) -> bool {
    let Some(pk_bytes) = base32z::decode_key(sender_b32z) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&pk_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = BASE64.decode(signature_b64) else {
        return false;
    };
    let sig_arr: [u8; 64] = match sig_bytes.try_into() {
        Ok(arr) => arr,
        Err(_) => return false,
    };
    let signature = Signature::from_bytes(&sig_arr);
    let digest: [u8; 64] = Sha512::digest(body).into();
    verifying_key.verify(&digest, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> IdentityKeys {
        let legacy = hex::encode([11u8; 32]);
        let ed = hex::encode([22u8; 32]);
        let x = hex::encode([33u8; 32]);
        IdentityKeys::from_hex(&legacy, &ed, &x).unwrap()
    }

    #[test]
    fn test_sign_verify_round_trip() {
        let id = identity();
        let body = b"push batch body";
        let sig = id.sign(body);
        assert!(verify_signature(&sig, body, id.address_b32z()));
    }

    #[test]
    fn test_tampered_body_fails() {
        let id = identity();
        let sig = id.sign(b"original");
        assert!(!verify_signature(&sig, b"originaL", id.address_b32z()));
    }

    #[test]
    fn test_bad_signature_encoding_fails() {
        let id = identity();
        assert!(!verify_signature("not-base64!!!", b"body", id.address_b32z()));
        assert!(!verify_signature(&id.sign(b"body"), b"body", "tooshort"));
    }

    #[test]
    fn test_our_record_address_matches_identity() {
        let id = identity();
        let record = id.our_record("1.2.3.4", 22021).unwrap();
        assert_eq!(record.base32z_pubkey(), id.address_b32z());
        assert_eq!(record.pubkey_hex, id.pubkey_hex());
    }

    #[test]
    fn test_cert_signature_is_cached() {
        let id = identity();
        id.set_cert_signature(b"cert pem bytes");
        let first = id.cert_signature().to_string();
        id.set_cert_signature(b"different");
        assert_eq!(id.cert_signature(), first);
    }
}
