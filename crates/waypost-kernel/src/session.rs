//! Conversation session state machine.
//!
//! ```text
//! Unauthenticated --start--> ConversationStarted --verify--> Verified
//!                                    |                          |
//!                                    +--------check in----------+--> CheckedIn
//! ```
//!
//! Cancelling the hosting agreement drops a checked-in session back to
//! Verified.

use waypost_types::error::{WaypostError, WaypostResult};
use waypost_types::identity::{
    random_challenge, verify_signature, IdentityId, NodeKeys, CHALLENGE_LEN, PUBLIC_KEY_LEN,
};
use waypost_wire::message::{negotiate_version, ProtocolVersion, ResponseBody};

/// Where a connection stands in the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConversationStatus {
    Unauthenticated,
    ConversationStarted,
    Verified,
    CheckedIn,
}

/// Per-connection conversation state.
#[derive(Debug)]
pub struct ConversationSession {
    status: ConversationStatus,
    version: Option<ProtocolVersion>,
    client_public_key: Vec<u8>,
    identity_id: Option<IdentityId>,
    server_challenge: [u8; CHALLENGE_LEN],
}

impl Default for ConversationSession {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationSession {
    pub fn new() -> Self {
        Self {
            status: ConversationStatus::Unauthenticated,
            version: None,
            client_public_key: Vec::new(),
            identity_id: None,
            server_challenge: [0u8; CHALLENGE_LEN],
        }
    }

    pub fn status(&self) -> ConversationStatus {
        self.status
    }

    /// Negotiated protocol version, once the conversation started.
    pub fn version(&self) -> Option<ProtocolVersion> {
        self.version
    }

    /// Public key the client presented.
    pub fn client_public_key(&self) -> &[u8] {
        &self.client_public_key
    }

    /// Identity id of the client. Set once the conversation started, but only
    /// proven once the session is [`Self::is_identified`].
    pub fn identity_id(&self) -> Option<IdentityId> {
        self.identity_id
    }

    /// Whether the client proved ownership of its key.
    pub fn is_identified(&self) -> bool {
        self.status >= ConversationStatus::Verified
    }

    /// Fail with bad-conversation-status unless at least `min` was reached.
    pub fn require(&self, min: ConversationStatus) -> WaypostResult<()> {
        if self.status >= min {
            Ok(())
        } else {
            Err(WaypostError::BadConversationStatus)
        }
    }

    /// Proven identity, or bad-conversation-status.
    pub fn proven_identity(&self) -> WaypostResult<IdentityId> {
        match self.identity_id {
            Some(id) if self.is_identified() => Ok(id),
            _ => Err(WaypostError::BadConversationStatus),
        }
    }

    /// Handle a start-conversation request.
    pub fn start(
        &mut self,
        keys: &NodeKeys,
        public_key: &[u8],
        client_challenge: &[u8],
        supported_versions: &[ProtocolVersion],
    ) -> WaypostResult<ResponseBody> {
        if self.status != ConversationStatus::Unauthenticated {
            return Err(WaypostError::BadConversationStatus);
        }
        let version = negotiate_version(supported_versions)
            .ok_or_else(|| WaypostError::Unsupported("no common protocol version".into()))?;
        if public_key.len() != PUBLIC_KEY_LEN {
            return Err(WaypostError::invalid_value("publicKey"));
        }
        if client_challenge.len() != CHALLENGE_LEN {
            return Err(WaypostError::invalid_value("clientChallenge"));
        }

        self.server_challenge = random_challenge();
        self.client_public_key = public_key.to_vec();
        self.identity_id = Some(IdentityId::from_public_key(public_key));
        self.version = Some(version);
        self.status = ConversationStatus::ConversationStarted;

        Ok(ResponseBody::StartConversation {
            version,
            public_key: keys.public_key().to_vec(),
            challenge: self.server_challenge.to_vec(),
            client_challenge: client_challenge.to_vec(),
            signature: keys.sign(client_challenge),
        })
    }

    /// Check the client's proof without changing state.
    ///
    /// `challenge` must echo the server challenge and `signature` must be the
    /// client's signature over it.
    pub fn check_proof(&self, challenge: &[u8], signature: &[u8]) -> WaypostResult<IdentityId> {
        let id = self
            .identity_id
            .ok_or(WaypostError::BadConversationStatus)?;
        if challenge != self.server_challenge.as_slice() {
            return Err(WaypostError::invalid_value("challenge"));
        }
        verify_signature(&self.client_public_key, &self.server_challenge, signature)?;
        Ok(id)
    }

    /// Handle a verify-identity request.
    pub fn verify(&mut self, challenge: &[u8], signature: &[u8]) -> WaypostResult<IdentityId> {
        if self.status != ConversationStatus::ConversationStarted {
            return Err(WaypostError::BadConversationStatus);
        }
        let id = self.check_proof(challenge, signature)?;
        self.status = ConversationStatus::Verified;
        Ok(id)
    }

    /// Handle a check-in request. `is_hosted` is asked only after the proof checks out.
    pub fn check_in(
        &mut self,
        challenge: &[u8],
        signature: &[u8],
        is_hosted: impl FnOnce(&IdentityId) -> bool,
    ) -> WaypostResult<IdentityId> {
        if !matches!(
            self.status,
            ConversationStatus::ConversationStarted | ConversationStatus::Verified
        ) {
            return Err(WaypostError::BadConversationStatus);
        }
        let id = self.check_proof(challenge, signature)?;
        if !is_hosted(&id) {
            return Err(WaypostError::NotFound("no hosting agreement".into()));
        }
        self.status = ConversationStatus::CheckedIn;
        Ok(id)
    }

    /// Leave the checked-in state after the hosting agreement ended.
    pub fn hosting_cancelled(&mut self) {
        if self.status == ConversationStatus::CheckedIn {
            self.status = ConversationStatus::Verified;
        }
    }
}
