//! Relay tokens.

use rand::RngCore;
use std::fmt;
use std::hash::{Hash, Hasher};
use subtle::ConstantTimeEq;

/// Length of a relay token.
pub const TOKEN_LEN: usize = 32;

/// Unguessable token naming one side of one call.
#[derive(Clone, Copy)]
pub struct RelayToken([u8; TOKEN_LEN]);

impl RelayToken {
    /// Mint a fresh random token.
    pub fn generate() -> Self {
        let mut bytes = [0u8; TOKEN_LEN];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Parse a token received from a client.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let bytes: [u8; TOKEN_LEN] = bytes.try_into().ok()?;
        Some(Self(bytes))
    }

    /// Raw token bytes.
    pub fn as_bytes(&self) -> &[u8; TOKEN_LEN] {
        &self.0
    }

    /// Token bytes as an owned vector, for wire messages.
    pub fn to_vec(&self) -> Vec<u8> {
        self.0.to_vec()
    }
}

impl PartialEq for RelayToken {
    fn eq(&self, other: &Self) -> bool {
        self.0.ct_eq(&other.0).into()
    }
}

impl Eq for RelayToken {}

impl Hash for RelayToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for RelayToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RelayToken({}..)", hex::encode(&self.0[..4]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokens_are_unique() {
        assert_ne!(RelayToken::generate(), RelayToken::generate());
    }

    #[test]
    fn test_from_slice_length() {
        let token = RelayToken::generate();
        assert_eq!(RelayToken::from_slice(&token.to_vec()), Some(token));
        assert!(RelayToken::from_slice(&[0u8; 31]).is_none());
        assert!(RelayToken::from_slice(&[0u8; 33]).is_none());
    }

    #[test]
    fn test_debug_does_not_leak_full_token() {
        let token = RelayToken::from_slice(&[0xAB; TOKEN_LEN]).unwrap();
        assert_eq!(format!("{token:?}"), "RelayToken(abababab..)");
    }
}
