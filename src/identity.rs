//! # Node Identity
//!
//! Every swarmgate node owns an Ed25519 keypair. The public key is the node's
//! [`Identity`]: it names the node in gossip frames, in the circuit table and
//! in the control channel's stats.
//!
//! The keypair is persisted as the raw 32-byte secret under
//! `<statedir>/keypair` and generated on first run if absent.
//!
//! ## Invariants
//!
//! - `Identity::from_bytes(b).as_bytes() == b`
//! - `Keypair::from_secret_key_bytes(k.secret_key_bytes()).identity() == k.identity()`

use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Length of the persisted secret key file.
pub const SECRET_KEY_LEN: usize = 32;

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(bytes);
        Self { signing_key }
    }

    pub fn secret_key_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key_bytes(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    pub fn identity(&self) -> Identity {
        Identity::from_bytes(self.public_key_bytes())
    }

    /// Load the keypair stored at `path`, or generate and persist a new one.
    ///
    /// Runs synchronously; callers on the event loop go through
    /// `spawn_blocking`.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        match std::fs::read(path) {
            Ok(bytes) => {
                let secret: [u8; SECRET_KEY_LEN] = bytes
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!(
                        "keypair file {} has {} bytes, expected {}",
                        path.display(),
                        bytes.len(),
                        SECRET_KEY_LEN
                    ))?;
                Ok(Self::from_secret_key_bytes(&secret))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let keypair = Self::generate();
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("failed to create {}", parent.display()))?;
                }
                write_secret(path, &keypair.secret_key_bytes())?;
                info!(identity = %keypair.identity(), "generated new node keypair");
                Ok(keypair)
            }
            Err(e) => Err(e).with_context(|| format!("failed to read {}", path.display())),
        }
    }
}

#[cfg(unix)]
fn write_secret(path: &Path, secret: &[u8; SECRET_KEY_LEN]) -> Result<()> {
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o600)
        .open(path)
        .with_context(|| format!("failed to create {}", path.display()))?;
    file.write_all(secret)
        .with_context(|| format!("failed to write {}", path.display()))
}

#[cfg(not(unix))]
fn write_secret(path: &Path, secret: &[u8; SECRET_KEY_LEN]) -> Result<()> {
    std::fs::write(path, secret).with_context(|| format!("failed to write {}", path.display()))
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &hex::encode(self.identity().as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identity([u8; 32]);

impl Identity {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != 32 {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Check that the identity is a usable Ed25519 public key.
    #[inline]
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }

    /// Short prefix used in log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..8])
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", self.short())
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl From<[u8; 32]> for Identity {
    fn from(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Identity {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_roundtrips_through_hex() {
        let kp = Keypair::generate();
        let id = kp.identity();
        let parsed = Identity::from_hex(&id.to_hex()).unwrap();
        assert_eq!(parsed, id);
        assert!(id.is_valid());
    }

    #[test]
    fn from_hex_rejects_wrong_length() {
        assert!(Identity::from_hex("abcd").is_err());
        assert!(Identity::from_hex("zz").is_err());
    }

    #[test]
    fn zero_identity_is_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
    }

    #[test]
    fn secret_key_roundtrip_preserves_identity() {
        let kp = Keypair::generate();
        let restored = Keypair::from_secret_key_bytes(&kp.secret_key_bytes());
        assert_eq!(restored.identity(), kp.identity());
    }

    #[test]
    fn load_or_generate_persists_keypair() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("keypair");

        let first = Keypair::load_or_generate(&path).unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap().len(), SECRET_KEY_LEN);

        let second = Keypair::load_or_generate(&path).unwrap();
        assert_eq!(first.identity(), second.identity());
    }

    #[test]
    fn load_rejects_truncated_keypair_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("keypair");
        std::fs::write(&path, [1u8; 7]).unwrap();
        assert!(Keypair::load_or_generate(&path).is_err());
    }
}
