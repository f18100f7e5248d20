//! TLS certificate configuration for the storage server.
//!
//! Certificates live under the data directory and are generated
//! self-signed on first start. Peers do not validate the chain; they pin
//! the TLS identity to the on-chain identity via the signed response
//! header instead.

use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Paths to the PEM-encoded certificate and private key.
#[derive(Debug, Clone)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsConfig {
    /// Load the certificate pair from `data_dir`, generating a self-signed
    /// pair on first start.
    ///
    /// # Errors
    ///
    /// Returns an error if generation fails (e.g. openssl not available,
    /// permission denied).
    pub fn new(data_dir: &Path) -> Result<Self, String> {
        let cert_path = data_dir.join("cert.pem");
        let key_path = data_dir.join("key.pem");

        if cert_path.exists() && key_path.exists() {
            info!(cert_path = %cert_path.display(), "Using existing TLS certificate");
        } else {
            Self::generate_self_signed(&cert_path, &key_path)?;
        }

        Ok(Self {
            cert_path,
            key_path,
        })
    }

    /// Read the certificate PEM, used to derive the pinned cert signature.
    pub fn cert_pem(&self) -> Result<Vec<u8>, String> {
        std::fs::read(&self.cert_path)
            .map_err(|e| format!("failed to read {}: {}", self.cert_path.display(), e))
    }

    fn generate_self_signed(cert_path: &Path, key_path: &Path) -> Result<(), String> {
        warn!("No TLS certificate found, generating a self-signed one");

        if let Some(parent) = cert_path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create cert directory: {}", e))?;
        }

        // Generate to temporary files first, then atomically rename so a
        // concurrent start never observes a half-written pair.
        let pid = std::process::id();
        let temp_cert = cert_path.with_extension(format!("tmp.{pid}"));
        let temp_key = key_path.with_extension(format!("tmp.{pid}"));

        let output = std::process::Command::new("openssl")
            .args([
                "req",
                "-x509",
                "-newkey",
                "ec",
                "-pkeyopt",
                "ec_paramgen_curve:prime256v1",
                "-keyout",
            ])
            .arg(&temp_key)
            .arg("-out")
            .arg(&temp_cert)
            .args(["-days", "3650", "-nodes", "-subj", "/CN=service-node"])
            .output()
            .map_err(|e| format!("failed to run openssl: {}", e))?;

        if !output.status.success() {
            let _ = std::fs::remove_file(&temp_cert);
            let _ = std::fs::remove_file(&temp_key);
            return Err(format!(
                "certificate generation failed: {}",
                String::from_utf8_lossy(&output.stderr)
            ));
        }

        std::fs::rename(&temp_cert, cert_path)
            .map_err(|e| format!("failed to rename temp cert: {}", e))?;
        std::fs::rename(&temp_key, key_path)
            .map_err(|e| format!("failed to rename temp key: {}", e))?;

        info!(
            cert_path = %cert_path.display(),
            key_path = %key_path.display(),
            "Generated self-signed certificate"
        );
        Ok(())
    }
}
