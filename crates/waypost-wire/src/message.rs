//! Wire protocol message types.
//!
//! Every frame body is a JSON-encoded [`WireMessage`]. Requests flow in both
//! directions: clients send requests to the node, and the node sends
//! notification requests (incoming call, relayed message) back to clients,
//! which answer them with ordinary responses carrying the same id.

use crate::frame::{self, FrameError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use waypost_types::config::ServerRole;
use waypost_types::error::WaypostError;
use waypost_types::profile::{EncodedLocation, Profile, ProfileSummary};
use waypost_types::serde_compat::{base64_bytes, base64_bytes_opt};

/// Message id used for responses to frames whose request id is unknown.
pub const UNKNOWN_MESSAGE_ID: u32 = 0;

/// Errors from encoding or decoding messages.
#[derive(Debug, Error)]
pub enum WireError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A wire protocol message (envelope).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Request id, echoed by the matching response.
    pub id: u32,
    /// Message variant.
    #[serde(flatten)]
    pub kind: WireMessageKind,
}

impl WireMessage {
    /// Build a request message.
    pub fn request(id: u32, request: WireRequest) -> Self {
        Self {
            id,
            kind: WireMessageKind::Request(request),
        }
    }

    /// Build a response message.
    pub fn response(id: u32, response: WireResponse) -> Self {
        Self {
            id,
            kind: WireMessageKind::Response(response),
        }
    }
}

/// Requests and responses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WireMessageKind {
    #[serde(rename = "request")]
    Request(WireRequest),
    #[serde(rename = "response")]
    Response(WireResponse),
}

/// A protocol version as `[major, minor, patch]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ProtocolVersion(pub [u8; 3]);

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Versions this node speaks, lowest first.
pub const SUPPORTED_VERSIONS: &[ProtocolVersion] = &[ProtocolVersion([1, 0, 0])];

/// Pick the highest version both sides support.
pub fn negotiate_version(client_versions: &[ProtocolVersion]) -> Option<ProtocolVersion> {
    client_versions
        .iter()
        .filter(|v| SUPPORTED_VERSIONS.contains(v))
        .max()
        .copied()
}

/// Request messages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum WireRequest {
    /// Echo `payload` back with the node clock.
    Ping {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// List the roles and ports of this node.
    ListRoles,
    /// Open a conversation and negotiate a version.
    StartConversation {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        client_challenge: Vec<u8>,
        supported_versions: Vec<ProtocolVersion>,
    },
    /// Prove ownership of the conversation key without checking in.
    VerifyIdentity {
        #[serde(with = "base64_bytes")]
        challenge: Vec<u8>,
        #[serde(with = "base64_bytes")]
        signature: Vec<u8>,
    },
    /// Prove ownership of a hosted identity and go online.
    CheckIn {
        #[serde(with = "base64_bytes")]
        challenge: Vec<u8>,
        #[serde(with = "base64_bytes")]
        signature: Vec<u8>,
    },
    /// Ask this node to host the verified identity.
    RegisterHosting { identity_type: String },
    /// Change fields of the checked-in identity's profile.
    UpdateProfile {
        #[serde(default)]
        name: Option<String>,
        #[serde(default)]
        location: Option<EncodedLocation>,
        #[serde(default)]
        extra_data: Option<String>,
        #[serde(default, with = "base64_bytes_opt")]
        thumbnail: Option<Vec<u8>>,
    },
    /// End the hosting agreement, optionally naming where the identity moved.
    CancelHostingAgreement {
        #[serde(default, with = "base64_bytes_opt")]
        redirect_identity_id: Option<Vec<u8>>,
    },
    /// Look up one identity.
    GetIdentityInformation {
        #[serde(with = "base64_bytes")]
        identity_id: Vec<u8>,
        #[serde(default)]
        include_thumbnail: bool,
        #[serde(default)]
        include_application_services: bool,
    },
    /// Register application service names on the checked-in session.
    ApplicationServiceAdd { service_names: Vec<String> },
    /// Remove one application service name.
    ApplicationServiceRemove { service_name: String },
    /// Call a service of another identity through this node.
    CallIdentityApplicationService {
        #[serde(with = "base64_bytes")]
        identity_id: Vec<u8>,
        service_name: String,
    },
    /// Node → callee: someone is calling. Answer `ok` or `error_rejected`.
    IncomingCallNotification {
        #[serde(with = "base64_bytes")]
        caller_public_key: Vec<u8>,
        service_name: String,
        #[serde(with = "base64_bytes")]
        callee_token: Vec<u8>,
    },
    /// Attach this application-service connection to one side of a call.
    ApplicationServiceBind {
        #[serde(with = "base64_bytes")]
        token: Vec<u8>,
    },
    /// Relay a message to the other side of the call.
    ApplicationServiceSendMessage {
        #[serde(with = "base64_bytes")]
        token: Vec<u8>,
        #[serde(with = "base64_bytes")]
        message: Vec<u8>,
    },
    /// Node → receiver: a relayed message. The response is the acknowledgement.
    ApplicationServiceReceiveMessageNotification {
        #[serde(with = "base64_bytes")]
        message: Vec<u8>,
    },
    /// Search the profile directory.
    Search {
        #[serde(default, rename = "type")]
        profile_type: String,
        #[serde(default)]
        name: String,
        #[serde(default)]
        extra_data: String,
        #[serde(default)]
        location: Option<EncodedLocation>,
        #[serde(default)]
        radius: u32,
        max_response_record_count: u32,
        max_total_record_count: u32,
        #[serde(default)]
        hosted_only: bool,
        #[serde(default)]
        include_thumbnails: bool,
    },
    /// Read a slice of the last search result.
    SearchPart { record_index: u32, record_count: u32 },
}

impl WireRequest {
    /// Short name for logging.
    pub fn method(&self) -> &'static str {
        match self {
            WireRequest::Ping { .. } => "ping",
            WireRequest::ListRoles => "list_roles",
            WireRequest::StartConversation { .. } => "start_conversation",
            WireRequest::VerifyIdentity { .. } => "verify_identity",
            WireRequest::CheckIn { .. } => "check_in",
            WireRequest::RegisterHosting { .. } => "register_hosting",
            WireRequest::UpdateProfile { .. } => "update_profile",
            WireRequest::CancelHostingAgreement { .. } => "cancel_hosting_agreement",
            WireRequest::GetIdentityInformation { .. } => "get_identity_information",
            WireRequest::ApplicationServiceAdd { .. } => "application_service_add",
            WireRequest::ApplicationServiceRemove { .. } => "application_service_remove",
            WireRequest::CallIdentityApplicationService { .. } => {
                "call_identity_application_service"
            }
            WireRequest::IncomingCallNotification { .. } => "incoming_call_notification",
            WireRequest::ApplicationServiceBind { .. } => "application_service_bind",
            WireRequest::ApplicationServiceSendMessage { .. } => {
                "application_service_send_message"
            }
            WireRequest::ApplicationServiceReceiveMessageNotification { .. } => {
                "application_service_receive_message_notification"
            }
            WireRequest::Search { .. } => "search",
            WireRequest::SearchPart { .. } => "search_part",
        }
    }
}

/// Response status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Ok,
    ErrorProtocolViolation,
    ErrorUnsupported,
    ErrorUnauthorized,
    ErrorBadRole,
    ErrorBadConversationStatus,
    ErrorInternal,
    ErrorQuotaExceeded,
    ErrorInvalidSignature,
    ErrorNotFound,
    ErrorInvalidValue,
    ErrorAlreadyExists,
    ErrorNotAvailable,
    ErrorRejected,
}

impl Status {
    /// Whether this is [`Status::Ok`].
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

impl From<&WaypostError> for Status {
    fn from(err: &WaypostError) -> Self {
        match err {
            WaypostError::ProtocolViolation(_) => Status::ErrorProtocolViolation,
            WaypostError::InvalidValue { .. } => Status::ErrorInvalidValue,
            WaypostError::InvalidSignature => Status::ErrorInvalidSignature,
            WaypostError::Unsupported(_) => Status::ErrorUnsupported,
            WaypostError::BadRole => Status::ErrorBadRole,
            WaypostError::BadConversationStatus => Status::ErrorBadConversationStatus,
            WaypostError::Unauthorized => Status::ErrorUnauthorized,
            WaypostError::NotFound(_) => Status::ErrorNotFound,
            WaypostError::NotAvailable(_) => Status::ErrorNotAvailable,
            WaypostError::Rejected => Status::ErrorRejected,
            WaypostError::QuotaExceeded(_) => Status::ErrorQuotaExceeded,
            WaypostError::AlreadyExists(_) => Status::ErrorAlreadyExists,
            WaypostError::Config(_) | WaypostError::Io(_) | WaypostError::Internal(_) => {
                Status::ErrorInternal
            }
        }
    }
}

/// A response: status, optional details, optional body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireResponse {
    pub status: Status,
    /// Human-readable details. For `error_invalid_value` this is the field name.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub details: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<ResponseBody>,
}

impl WireResponse {
    /// Bare success.
    pub fn ok() -> Self {
        Self {
            status: Status::Ok,
            details: String::new(),
            body: None,
        }
    }

    /// Success carrying `body`.
    pub fn ok_with(body: ResponseBody) -> Self {
        Self {
            status: Status::Ok,
            details: String::new(),
            body: Some(body),
        }
    }

    /// Failure with `status` and `details`.
    pub fn error(status: Status, details: impl Into<String>) -> Self {
        Self {
            status,
            details: details.into(),
            body: None,
        }
    }

    /// Map an internal error onto the wire.
    ///
    /// Invalid values report the bare field name as details so clients can
    /// match on it.
    pub fn from_error(err: &WaypostError) -> Self {
        let details = match err {
            WaypostError::InvalidValue { field } => field.clone(),
            WaypostError::Config(_) | WaypostError::Io(_) | WaypostError::Internal(_) => {
                "internal error".to_string()
            }
            other => other.to_string(),
        };
        Self::error(Status::from(err), details)
    }
}

impl From<WaypostError> for WireResponse {
    fn from(err: WaypostError) -> Self {
        Self::from_error(&err)
    }
}

/// Role entry of a [`ResponseBody::ListRoles`] response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleInfo {
    pub role: ServerRole,
    pub port: u16,
    pub is_tcp: bool,
    pub is_tls: bool,
}

/// Successful response payloads.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ResponseBody {
    Pong {
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
        /// Node clock, Unix milliseconds.
        clock: i64,
    },
    ListRoles {
        roles: Vec<RoleInfo>,
    },
    StartConversation {
        version: ProtocolVersion,
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
        #[serde(with = "base64_bytes")]
        challenge: Vec<u8>,
        #[serde(with = "base64_bytes")]
        client_challenge: Vec<u8>,
        /// Node signature over `client_challenge`.
        #[serde(with = "base64_bytes")]
        signature: Vec<u8>,
    },
    GetIdentityInformation {
        #[serde(with = "base64_bytes")]
        public_key: Vec<u8>,
        is_hosted: bool,
        is_online: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        profile: Option<Profile>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "base64_bytes_opt"
        )]
        redirect_identity_id: Option<Vec<u8>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        application_services: Vec<String>,
    },
    CallIdentityApplicationService {
        #[serde(with = "base64_bytes")]
        caller_token: Vec<u8>,
    },
    Search {
        total_record_count: u32,
        max_response_record_count: u32,
        profiles: Vec<ProfileSummary>,
    },
    SearchPart {
        record_index: u32,
        record_count: u32,
        profiles: Vec<ProfileSummary>,
    },
}

/// Encode a message into a complete frame.
pub fn encode_message(msg: &WireMessage, max_frame_size: usize) -> Result<Vec<u8>, WireError> {
    let json = serde_json::to_vec(msg)?;
    Ok(frame::encode_frame(&json, max_frame_size)?)
}

/// Parse a frame body into a message.
pub fn decode_message(body: &[u8]) -> Result<WireMessage, serde_json::Error> {
    serde_json::from_slice(body)
}

/// Best-effort request id of a body that failed to decode as a message.
pub fn peek_message_id(body: &[u8]) -> Option<u32> {
    #[derive(Deserialize)]
    struct IdOnly {
        id: u32,
    }
    serde_json::from_slice::<IdOnly>(body).ok().map(|m| m.id)
}

/// Write one framed message.
pub async fn write_message<W>(
    writer: &mut W,
    msg: &WireMessage,
    max_frame_size: usize,
) -> Result<(), WireError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_vec(msg)?;
    frame::write_frame(writer, &json, max_frame_size).await?;
    Ok(())
}

/// Read one framed message.
pub async fn read_message<R>(reader: &mut R, max_frame_size: usize) -> Result<WireMessage, WireError>
where
    R: AsyncRead + Unpin,
{
    let body = frame::read_frame(reader, max_frame_size).await?;
    Ok(decode_message(&body)?)
}
