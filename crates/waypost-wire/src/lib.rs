//! Waypost wire protocol.
//!
//! Connections carry length-prefixed frames whose bodies are JSON-encoded
//! [`WireMessage`]s.
//!
//! ## Layout
//!
//! - **frame**: marker byte + little-endian length header, size limit, sync
//!   and async codecs
//! - **message**: the request/response envelope, status codes and payloads

pub mod frame;
pub mod message;

pub use frame::{FrameBuffer, FrameError, DEFAULT_MAX_FRAME_SIZE};
pub use message::{
    ProtocolVersion, ResponseBody, RoleInfo, Status, WireError, WireMessage, WireMessageKind,
    WireRequest, WireResponse,
};
