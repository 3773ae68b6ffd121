//! WebSocket transport implementation using tokio-tungstenite
//!
//! Each link is one WebSocket carrying JSON text frames. The TCP socket is
//! bound to the caller's local address before connecting, so every link leaves
//! the host from the interface it was allocated to.
//!
//! # Features
//!
//! - **Encryption**: TLS via rustls (wss://), trust anchors from a PEM bundle
//! - **Source binding**: outbound socket bound to a specific local IP
//! - **Plain mode**: ws:// for local coordinators and tests

pub mod config;
pub mod connector;

pub use config::WebSocketConfig;
pub use connector::WebSocketConnector;
