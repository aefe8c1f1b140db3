//! Identity keys, identity ids and challenge signing.
//!
//! An identity is addressed by its Ed25519 public key. Its identity id is the
//! SHA-256 of that key. Authentication is a plain challenge/response: the
//! holder of the private key signs a fresh 32-byte challenge chosen by the
//! other side, and the verifier checks the signature against the key it was
//! shown.

use crate::error::WaypostError;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::fmt;

/// Length of an Ed25519 public key.
pub const PUBLIC_KEY_LEN: usize = 32;

/// Length of an identity id (SHA-256 digest).
pub const IDENTITY_ID_LEN: usize = 32;

/// Length of a conversation challenge.
pub const CHALLENGE_LEN: usize = 32;

/// Identity id: SHA-256 of the identity's public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct IdentityId([u8; IDENTITY_ID_LEN]);

impl IdentityId {
    /// Derive the id of `public_key`.
    pub fn from_public_key(public_key: &[u8]) -> Self {
        let digest = Sha256::digest(public_key);
        let mut id = [0u8; IDENTITY_ID_LEN];
        id.copy_from_slice(&digest);
        Self(id)
    }

    /// Wrap raw id bytes. Returns `None` unless exactly [`IDENTITY_ID_LEN`] bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let id: [u8; IDENTITY_ID_LEN] = bytes.try_into().ok()?;
        Some(Self(id))
    }

    /// Raw id bytes.
    pub fn as_bytes(&self) -> &[u8; IDENTITY_ID_LEN] {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(self.0))
    }
}

impl fmt::Debug for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityId({})", hex::encode(&self.0[..8]))
    }
}

/// Generate a fresh random conversation challenge.
pub fn random_challenge() -> [u8; CHALLENGE_LEN] {
    let mut challenge = [0u8; CHALLENGE_LEN];
    rand::thread_rng().fill_bytes(&mut challenge);
    challenge
}

/// The node's long-term signing identity.
pub struct NodeKeys {
    signing_key: SigningKey,
}

impl NodeKeys {
    /// Generate a new random identity.
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    /// Restore an identity from a hex-encoded 32-byte seed.
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, WaypostError> {
        let bytes = hex::decode(seed_hex.trim())
            .map_err(|e| WaypostError::Config(format!("identity key is not hex: {e}")))?;
        let seed: [u8; 32] = bytes.as_slice().try_into().map_err(|_| {
            WaypostError::Config("identity key must be 32 bytes (64 hex chars)".into())
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Hex-encoded seed, for persisting a generated key.
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Public key bytes.
    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// Identity id of this node.
    pub fn identity_id(&self) -> IdentityId {
        IdentityId::from_public_key(&self.public_key())
    }

    /// Sign `data` with the node key.
    pub fn sign(&self, data: &[u8]) -> Vec<u8> {
        self.signing_key.sign(data).to_bytes().to_vec()
    }
}

impl fmt::Debug for NodeKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeKeys")
            .field("identity_id", &self.identity_id())
            .finish_non_exhaustive()
    }
}

/// Verify an Ed25519 `signature` over `data` made by `public_key`.
///
/// Malformed keys and signatures are reported the same way as a mismatch.
pub fn verify_signature(
    public_key: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), WaypostError> {
    let pk_bytes: [u8; PUBLIC_KEY_LEN] = public_key
        .try_into()
        .map_err(|_| WaypostError::InvalidSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&pk_bytes).map_err(|_| WaypostError::InvalidSignature)?;
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| WaypostError::InvalidSignature)?;
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key
        .verify(data, &signature)
        .map_err(|_| WaypostError::InvalidSignature)
}
