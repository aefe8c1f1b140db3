//! Shared error types for the Waypost node.

use thiserror::Error;

/// Top-level error type for the Waypost node.
///
/// Every variant except [`WaypostError::Io`] and [`WaypostError::Config`] maps
/// onto a status code of the wire protocol and is reported to the client as a
/// typed response.
#[derive(Error, Debug)]
pub enum WaypostError {
    /// The peer broke the framing or message rules. Always fatal for the connection.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// A request field holds an invalid value. `field` names the offending field.
    #[error("Invalid value in field '{field}'")]
    InvalidValue {
        /// Wire name of the offending field.
        field: String,
    },

    /// A signature did not verify against the claimed public key.
    #[error("Invalid signature")]
    InvalidSignature,

    /// Version negotiation found no mutually supported protocol version.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The request is not served by any role of this listener.
    #[error("Request not allowed on this port")]
    BadRole,

    /// The connection is in the wrong conversation state for the request.
    #[error("Bad conversation status")]
    BadConversationStatus,

    /// The identity behind the connection has not proven the required level of trust.
    #[error("Unauthorized")]
    Unauthorized,

    /// Unknown token, identity or record.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The target is transiently unreachable.
    #[error("Not available: {0}")]
    NotAvailable(String),

    /// The remote party explicitly refused.
    #[error("Rejected")]
    Rejected,

    /// A capacity limit would be exceeded.
    #[error("Quota exceeded: {0}")]
    QuotaExceeded(String),

    /// The record being created already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl WaypostError {
    /// Shorthand for an [`WaypostError::InvalidValue`] naming `field`.
    pub fn invalid_value(field: impl Into<String>) -> Self {
        Self::InvalidValue {
            field: field.into(),
        }
    }
}

/// Alias for Result with WaypostError.
pub type WaypostResult<T> = Result<T, WaypostError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_value_names_field() {
        let err = WaypostError::invalid_value("recordIndex");
        assert_eq!(err.to_string(), "Invalid value in field 'recordIndex'");
    }

    #[test]
    fn test_io_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone");
        let err: WaypostError = io.into();
        assert!(matches!(err, WaypostError::Io(_)));
    }
}
