use std::fs;
use std::io;
use std::path::Path;

use sdx_core::PeerId;
use thiserror::Error;

use crate::signing::{IdentityKey, IdentitySigner};

/// Length of the on-disk identity file: 32-byte seed followed by the
/// 32-byte public key for cross-checking.
const IDENTITY_FILE_LEN: usize = 64;

/// Errors returned by identity key file handling.
#[derive(Debug, Error)]
pub enum IdentityError {
    #[error("failed to read identity key file: {0}")]
    Read(io::Error),
    #[error("failed to write identity key file: {0}")]
    Write(io::Error),
    #[error("identity key file is malformed")]
    Malformed,
    #[error("identity key file public key does not match its seed")]
    KeyMismatch,
}

/// The node's long-term signing identity, bound to its key file.
///
/// The stable peer identifier is the Ed25519 public key.
#[derive(Debug, Clone)]
pub struct NodeIdentity {
    key: IdentityKey,
}

impl NodeIdentity {
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: IdentityKey::from_seed(seed),
        }
    }

    pub fn generate() -> Self {
        Self {
            key: IdentityKey::generate(),
        }
    }

    pub fn peer_id(&self) -> PeerId {
        self.key.peer_id()
    }

    pub fn key(&self) -> &IdentityKey {
        &self.key
    }

    /// Loads the identity from its binary key file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let raw = fs::read(path.as_ref()).map_err(IdentityError::Read)?;
        if raw.len() != IDENTITY_FILE_LEN {
            return Err(IdentityError::Malformed);
        }
        let mut seed = [0_u8; 32];
        seed.copy_from_slice(&raw[..32]);
        let identity = Self::from_seed(seed);
        if identity.peer_id().as_bytes()[..] != raw[32..] {
            return Err(IdentityError::KeyMismatch);
        }
        Ok(identity)
    }

    /// Writes the identity key file. The file is written once at node
    /// initialization and treated as read-only afterwards.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), IdentityError> {
        let mut raw = Vec::with_capacity(IDENTITY_FILE_LEN);
        raw.extend_from_slice(&self.key.seed());
        raw.extend_from_slice(self.peer_id().as_bytes());
        let path = path.as_ref();
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, raw).map_err(IdentityError::Write)?;
        fs::rename(&tmp, path).map_err(IdentityError::Write)
    }

    /// Loads the identity if the key file exists, generating and saving a
    /// fresh one otherwise.
    pub fn load_or_generate(path: impl AsRef<Path>) -> Result<Self, IdentityError> {
        let path = path.as_ref();
        if path.exists() {
            return Self::load(path);
        }
        let identity = Self::generate();
        identity.save(path)?;
        Ok(identity)
    }
}
