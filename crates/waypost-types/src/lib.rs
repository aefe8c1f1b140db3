//! Core types for the Waypost identity relay node.
//!
//! This crate defines the data structures shared by the wire protocol, the
//! call-relay engine, the profile search engine and the kernel. It contains
//! no networking and no business logic.

pub mod config;
pub mod error;
pub mod identity;
pub mod profile;
pub mod serde_compat;
