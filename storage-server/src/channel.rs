//! Request-level channel encryption for client RPC.
//!
//! The client sends its ephemeral X25519 public key in the
//! `X-Arqma-EphemKey` header; bodies in both directions are
//! `base64(AES-256-GCM(plaintext))` under a key derived from the
//! X25519 shared secret. The payload itself stays opaque; this only
//! protects the request envelope in transit.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use x25519_dalek::{PublicKey, StaticSecret};

/// Header carrying the client's ephemeral X25519 public key (hex).
pub const EPHEMKEY_HEADER: &str = "X-Arqma-EphemKey";

const NONCE_LEN: usize = 12;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("ephemeral key is not a valid x25519 public key")]
    BadEphemeralKey,
    #[error("could not decrypt body")]
    Decrypt,
    #[error("could not encrypt body")]
    Encrypt,
}

pub struct ChannelCipher {
    secret: StaticSecret,
}

impl ChannelCipher {
    pub fn new(secret: StaticSecret) -> Self {
        Self { secret }
    }

    fn derive_key(&self, client_pub_hex: &str) -> Result<[u8; 32], ChannelError> {
        let bytes = hex::decode(client_pub_hex).map_err(|_| ChannelError::BadEphemeralKey)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ChannelError::BadEphemeralKey)?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(arr));
        Ok(Sha256::digest(shared.as_bytes()).into())
    }

    /// Encrypt a plaintext for the peer identified by `client_pub_hex`.
    /// Output is `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8], client_pub_hex: &str) -> Result<Vec<u8>, ChannelError> {
        let key = self.derive_key(client_pub_hex)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ChannelError::Encrypt)?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext)
            .map_err(|_| ChannelError::Encrypt)?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Decrypt a `nonce || ciphertext` blob from the peer identified by
    /// `client_pub_hex`.
    pub fn decrypt(&self, blob: &[u8], client_pub_hex: &str) -> Result<Vec<u8>, ChannelError> {
        if blob.len() < NONCE_LEN {
            return Err(ChannelError::Decrypt);
        }
        let key = self.derive_key(client_pub_hex)?;
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|_| ChannelError::Decrypt)?;
        let (nonce, ciphertext) = blob.split_at(NONCE_LEN);
        cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| ChannelError::Decrypt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair() -> (ChannelCipher, String, ChannelCipher, String) {
        let server_secret = StaticSecret::from([7u8; 32]);
        let client_secret = StaticSecret::from([9u8; 32]);
        let server_pub = hex::encode(PublicKey::from(&server_secret).as_bytes());
        let client_pub = hex::encode(PublicKey::from(&client_secret).as_bytes());
        (
            ChannelCipher::new(server_secret),
            server_pub,
            ChannelCipher::new(client_secret),
            client_pub,
        )
    }

    #[test]
    fn test_round_trip_between_both_sides() {
        let (server, server_pub, client, client_pub) = pair();
        let wire = client.encrypt(b"{\"method\":\"store\"}", &server_pub).unwrap();
        let plain = server.decrypt(&wire, &client_pub).unwrap();
        assert_eq!(plain, b"{\"method\":\"store\"}");
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let (server, server_pub, client, client_pub) = pair();
        let mut wire = client.encrypt(b"payload", &server_pub).unwrap();
        let last = wire.len() - 1;
        wire[last] ^= 1;
        assert!(matches!(
            server.decrypt(&wire, &client_pub),
            Err(ChannelError::Decrypt)
        ));
    }

    #[test]
    fn test_bad_ephemeral_key_is_rejected() {
        let (server, _, _, _) = pair();
        assert!(matches!(
            server.decrypt(&[0u8; 64], "zz"),
            Err(ChannelError::BadEphemeralKey)
        ));
        assert!(server.encrypt(b"x", "abcd").is_err());
    }

    #[test]
    fn test_truncated_blob_is_rejected() {
        let (server, _, _, client_pub) = pair();
        assert!(matches!(
            server.decrypt(&[1, 2, 3], &client_pub),
            Err(ChannelError::Decrypt)
        ));
    }
}
