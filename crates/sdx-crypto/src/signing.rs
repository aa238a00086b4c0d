use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use sdx_core::PeerId;

/// Length of a detached signature on the wire (announcements, hellos).
pub const SIGNATURE_LEN: usize = 64;

/// Detached signature bytes as they travel on the wire.
pub type SignatureBytes = [u8; SIGNATURE_LEN];

/// The identity collaborator as the engine consumes it: detached
/// signatures under the node's long-term key, and the stable peer
/// identifier derived from that key.
pub trait IdentitySigner: Send + Sync {
    /// The peer identifier announcements and hellos are attributed to;
    /// this is the Ed25519 public key.
    fn peer_id(&self) -> PeerId;
    /// Signs `message` under the long-term key. Ed25519 signing over an
    /// in-memory key cannot fail.
    fn sign(&self, message: &[u8]) -> SignatureBytes;
}

/// The node's long-term Ed25519 identity key.
#[derive(Debug, Clone)]
pub struct IdentityKey {
    key: SigningKey,
}

impl IdentityKey {
    /// Rebuilds the key from its 32-byte seed.
    pub fn from_seed(seed: [u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(&seed),
        }
    }

    /// Draws a fresh random identity.
    pub fn generate() -> Self {
        let mut seed = [0_u8; 32];
        rand::RngCore::fill_bytes(&mut rand::thread_rng(), &mut seed);
        Self::from_seed(seed)
    }

    /// The seed half persisted in the identity key file.
    pub fn seed(&self) -> [u8; 32] {
        self.key.to_bytes()
    }
}

impl IdentitySigner for IdentityKey {
    fn peer_id(&self) -> PeerId {
        PeerId(self.key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> SignatureBytes {
        use ed25519_dalek::Signer as _;
        self.key.sign(message).to_bytes()
    }
}

/// Checks a detached signature against the claimed signing peer.
///
/// Peer identifiers arrive off the network; bytes that do not form a valid
/// public key fail the check rather than surfacing an error.
pub fn verify_signature(signer: &PeerId, message: &[u8], signature: &SignatureBytes) -> bool {
    use ed25519_dalek::Verifier as _;
    let Ok(key) = VerifyingKey::from_bytes(signer.as_bytes()) else {
        return false;
    };
    key.verify(message, &Signature::from_bytes(signature)).is_ok()
}
