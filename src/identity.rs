//! # Identity primitives
//!
//! A satellite's identity is its Ed25519 public key: possession of the
//! private key proves identity, and the hex encoding of the public key is
//! the peer id used everywhere in the overlay (registry keys, ban list,
//! log output).
//!
//! [`Keypair`] wraps the signing key and handles on-disk serialization for
//! the daemon (`--key` / `--generate`) and the `satkey` tool. The key file
//! is a small JSON document holding the hex-encoded secret key.

use std::path::Path;

use anyhow::{Context, Result};
use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// A 32-byte Ed25519 public key identifying one node in the overlay.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
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

    /// Hex encoding used as the peer id throughout the satellite.
    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).context("identity must be hex")?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("identity must be 64 hex characters (32 bytes)"))?;
        Ok(Self(arr))
    }

    /// Rejects byte strings that cannot be a usable Ed25519 public key.
    pub fn is_valid(&self) -> bool {
        if self.0.iter().all(|&b| b == 0) || self.0.iter().all(|&b| b == 0xFF) {
            return false;
        }
        VerifyingKey::try_from(self.0.as_slice()).is_ok()
    }
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identity({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

/// On-disk form of a keypair.
#[derive(Serialize, Deserialize)]
struct KeyExport {
    secret: String,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_key_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
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

    /// Serialize to the key-file JSON format.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        let export = KeyExport {
            secret: hex::encode(self.secret_key_bytes()),
        };
        serde_json::to_vec_pretty(&export).context("failed to serialize keypair")
    }

    pub fn deserialize(bytes: &[u8]) -> Result<Self> {
        let export: KeyExport =
            serde_json::from_slice(bytes).context("malformed key file")?;
        let secret = hex::decode(&export.secret).context("key file secret must be hex")?;
        let arr: [u8; 32] = secret
            .try_into()
            .map_err(|_| anyhow::anyhow!("key file secret must be 32 bytes"))?;
        Ok(Self::from_secret_key_bytes(&arr))
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path.as_ref())
            .with_context(|| format!("failed to read key file {}", path.as_ref().display()))?;
        Self::deserialize(&bytes)
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        let bytes = self.serialize()?;
        std::fs::write(path.as_ref(), bytes)
            .with_context(|| format!("failed to write key file {}", path.as_ref().display()))
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("identity", &self.identity().to_hex())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_hex_round_trip() {
        let keypair = Keypair::generate();
        let identity = keypair.identity();
        let parsed = Identity::from_hex(&identity.to_hex()).unwrap();
        assert_eq!(identity, parsed);
    }

    #[test]
    fn identity_rejects_bad_hex() {
        assert!(Identity::from_hex("abc").is_err());
        assert!(Identity::from_hex("zz").is_err());
        let too_long = "ab".repeat(40);
        assert!(Identity::from_hex(&too_long).is_err());
    }

    #[test]
    fn trivial_identities_are_invalid() {
        assert!(!Identity::from_bytes([0u8; 32]).is_valid());
        assert!(!Identity::from_bytes([0xFF; 32]).is_valid());
        assert!(Keypair::generate().identity().is_valid());
    }

    #[test]
    fn key_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("node.key");

        let keypair = Keypair::generate();
        keypair.write_to(&path).unwrap();

        let loaded = Keypair::read_from(&path).unwrap();
        assert_eq!(loaded.identity(), keypair.identity());
        assert_eq!(loaded.secret_key_bytes(), keypair.secret_key_bytes());
    }

    #[test]
    fn malformed_key_file_rejected() {
        assert!(Keypair::deserialize(b"not json").is_err());
        assert!(Keypair::deserialize(br#"{"secret":"abcd"}"#).is_err());
    }
}
