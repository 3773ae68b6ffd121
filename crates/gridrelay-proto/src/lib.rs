//! Coordinator Protocol Definitions
//!
//! This crate defines the JSON envelope exchanged with the coordinator over each
//! persistent connection, plus the payloads of the actions the node understands.

pub mod messages;

pub use messages::*;

/// Protocol version advertised in keepalive pings
pub const PROTOCOL_VERSION: &str = "1.0.0";

/// Action names as they appear on the wire
pub mod actions {
    pub const AUTH: &str = "AUTH";
    pub const HTTP_REQUEST: &str = "HTTP_REQUEST";
    pub const PING: &str = "PING";
    pub const PONG: &str = "PONG";
}
