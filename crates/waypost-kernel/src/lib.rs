//! Waypost node kernel.
//!
//! Accepts connections on the configured role listeners, runs the
//! conversation state machine of each one, and dispatches authenticated
//! requests to the call-relay engine, the profile directory and the search
//! engine.

pub mod config;
pub mod connection;
pub mod directory;
pub mod error;
pub mod handlers;
pub mod node;
pub mod session;
pub mod supervisor;
pub mod tls;

pub use error::{KernelError, KernelResult};
pub use node::{Node, NodeState};
