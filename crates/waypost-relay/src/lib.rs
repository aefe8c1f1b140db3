//! Call-relay engine.
//!
//! Pairs a caller and a callee through one-shot tokens and relays opaque
//! messages between their application-service connections.
//!
//! ## Architecture
//!
//! - **RelayEngine**: the shared registry of live sessions, tokens and pairings
//! - **Mailbox**: the only way the engine talks to a connection
//! - **Forwarder**: one ordered task per pairing side, bounded by a semaphore

pub mod engine;
pub mod forward;
pub mod mailbox;
pub mod token;

pub use engine::{BindOutcome, PendingBind, RelayEngine, RelayLimits};
pub use mailbox::{CloseReason, ConnectionId, Mailbox, MailboxReceiver, PeerEvent};
pub use token::RelayToken;

use thiserror::Error;
use waypost_types::error::WaypostError;

/// Errors from relay operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    /// Unknown, consumed or superseded token, or a pairing that no longer exists.
    #[error("Relay token not found")]
    NotFound,
    /// The callee is offline, did not answer, or does not offer the service.
    #[error("Callee not available: {0}")]
    NotAvailable(String),
    /// The callee refused the call.
    #[error("Call rejected by callee")]
    Rejected,
    /// The session would offer too many application services.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),
    /// The session does not offer the named application service.
    #[error("Application service not registered")]
    UnknownService,
}

impl From<RelayError> for WaypostError {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::NotFound => WaypostError::NotFound("relay token".into()),
            RelayError::NotAvailable(reason) => WaypostError::NotAvailable(reason),
            RelayError::Rejected => WaypostError::Rejected,
            RelayError::QuotaExceeded(what) => WaypostError::QuotaExceeded(what),
            RelayError::UnknownService => WaypostError::NotFound("application service".into()),
        }
    }
}
