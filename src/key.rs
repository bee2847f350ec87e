//! Shared ed25519 keypair management.
//!
//! The whole fleet shares one keypair (see SPEC_FULL.md design note on
//! per-instance authorization via `ConfigureSSHAccess`). Grounded on the
//! teacher's `load_or_generate_server_key`, generalized to a configurable
//! directory and with owner-only file permissions on the private key.

use std::path::{Path, PathBuf};

use log::info;
use russh_keys::{Algorithm, HashAlg, PrivateKey};

use crate::error::KeyError;

const PRIVATE_KEY_FILE: &str = "id_ed25519";
const PUBLIC_KEY_FILE: &str = "id_ed25519.pub";

/// Loads or generates the ed25519 keypair shared across every agent
/// connection, and formats it for OpenSSH consumption.
pub struct KeyProvider {
    dir: PathBuf,
}

impl KeyProvider {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Path the shared fleet private key lives at (or will be generated at).
    pub fn private_key_path(&self) -> PathBuf {
        self.dir.join(PRIVATE_KEY_FILE)
    }

    /// Loads the keypair from `self.dir`, generating and persisting one on
    /// first use. Returns the signer and the OpenSSH public key text.
    pub fn ensure_key_pair(&self) -> Result<(PrivateKey, String), KeyError> {
        let private_path = self.dir.join(PRIVATE_KEY_FILE);
        let public_path = self.dir.join(PUBLIC_KEY_FILE);

        if private_path.exists() {
            let key = Self::load_private_key(&private_path)?;
            let public_text = public_key_text(&key);
            if !public_path.exists() {
                write_public_key(&public_path, &public_text)?;
            }
            info!(
                "Loaded fleet keypair from {} (fingerprint {})",
                private_path.display(),
                Self::fingerprint(&public_text)
            );
            Ok((key, public_text))
        } else {
            std::fs::create_dir_all(&self.dir)?;
            let key = PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
                .map_err(|e| KeyError::Format(e.into()))?;
            write_private_key(&private_path, &key)?;
            let public_text = public_key_text(&key);
            write_public_key(&public_path, &public_text)?;
            info!(
                "Generated new fleet keypair at {} (fingerprint {})",
                private_path.display(),
                Self::fingerprint(&public_text)
            );
            Ok((key, public_text))
        }
    }

    /// Loads and parses a private key from an arbitrary OpenSSH-formatted
    /// file, independent of `self.dir` — used for per-call, per-instance
    /// key paths rather than the shared fleet keypair.
    pub fn load_private_key(path: &Path) -> Result<PrivateKey, KeyError> {
        let data = std::fs::read_to_string(path)?;
        PrivateKey::from_openssh(&data).map_err(|e| KeyError::Format(e.into()))
    }

    /// Formats a raw OpenSSH public key line as a single authorized_keys
    /// entry (identical format; kept as a distinct name for callers that
    /// install it into an agent's `authorized_keys`).
    pub fn format_authorized_key(public_key_text: &str) -> String {
        public_key_text.trim().to_string()
    }

    /// SHA256 fingerprint (base64, OpenSSH `SHA256:...` form) of a public key
    /// in OpenSSH text form.
    pub fn fingerprint(public_key_text: &str) -> String {
        match russh_keys::ssh_key::PublicKey::from_openssh(public_key_text.trim()) {
            Ok(key) => key.fingerprint(HashAlg::Sha256).to_string(),
            Err(_) => "SHA256:invalid".to_string(),
        }
    }
}

fn public_key_text(key: &PrivateKey) -> String {
    key.public_key()
        .to_openssh()
        .unwrap_or_else(|_| String::new())
}

#[cfg(unix)]
fn write_private_key(path: &Path, key: &PrivateKey) -> Result<(), KeyError> {
    use std::os::unix::fs::PermissionsExt;

    let data = key
        .to_openssh(russh_keys::ssh_key::LineEnding::LF)
        .map_err(|e| KeyError::Format(e.into()))?;
    std::fs::write(path, data.as_bytes())?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_private_key(path: &Path, key: &PrivateKey) -> Result<(), KeyError> {
    let data = key
        .to_openssh(russh_keys::ssh_key::LineEnding::LF)
        .map_err(|e| KeyError::Format(e.into()))?;
    std::fs::write(path, data.as_bytes())?;
    Ok(())
}

fn write_public_key(path: &Path, text: &str) -> Result<(), KeyError> {
    std::fs::write(path, text.as_bytes())?;
    Ok(())
}
