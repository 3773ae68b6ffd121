//! Protocol message types

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;
use uuid::Uuid;

use crate::{actions, PROTOCOL_VERSION};

/// Errors raised while decoding or encoding protocol frames
#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("Invalid message: {0}")]
    InvalidMessage(#[from] serde_json::Error),

    #[error("Frame is not valid UTF-8")]
    InvalidEncoding,
}

/// RPC action carried in the `action` field of an envelope
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum RpcAction {
    /// Coordinator asks for the authentication descriptor
    Auth,
    /// Coordinator asks the node to relay an HTTP request
    HttpRequest,
    /// Keepalive acknowledgment
    Pong,
    /// Keepalive sent by the node
    Ping,
    /// Anything else; kept verbatim for logging
    Unknown(String),
}

impl RpcAction {
    pub fn as_str(&self) -> &str {
        match self {
            RpcAction::Auth => actions::AUTH,
            RpcAction::HttpRequest => actions::HTTP_REQUEST,
            RpcAction::Pong => actions::PONG,
            RpcAction::Ping => actions::PING,
            RpcAction::Unknown(name) => name,
        }
    }
}

impl From<String> for RpcAction {
    fn from(name: String) -> Self {
        match name.as_str() {
            actions::AUTH => RpcAction::Auth,
            actions::HTTP_REQUEST => RpcAction::HttpRequest,
            actions::PONG => RpcAction::Pong,
            actions::PING => RpcAction::Ping,
            _ => RpcAction::Unknown(name),
        }
    }
}

impl From<RpcAction> for String {
    fn from(action: RpcAction) -> Self {
        match action {
            RpcAction::Unknown(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for RpcAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound RPC envelope: `{id, action, data}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcMessage {
    pub id: String,
    pub action: RpcAction,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl RpcMessage {
    /// Decode a text frame
    pub fn parse(text: &str) -> Result<Self, ProtoError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Decode a binary frame holding UTF-8 JSON
    pub fn parse_bytes(bytes: &[u8]) -> Result<Self, ProtoError> {
        let text = std::str::from_utf8(bytes).map_err(|_| ProtoError::InvalidEncoding)?;
        Self::parse(text)
    }
}

/// Outbound result correlated to an inbound message by `id`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    pub origin_action: RpcAction,
    pub result: serde_json::Value,
}

impl RpcResponse {
    pub fn new(id: impl Into<String>, origin_action: RpcAction, result: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            origin_action,
            result,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Keepalive ping: `{id, version, action: "PING", data: {}}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PingMessage {
    pub id: String,
    pub version: String,
    pub action: RpcAction,
    pub data: serde_json::Value,
}

impl PingMessage {
    /// Create a ping with a fresh correlation id
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            version: PROTOCOL_VERSION.to_string(),
            action: RpcAction::Ping,
            data: serde_json::Value::Object(serde_json::Map::new()),
        }
    }

    pub fn to_text(&self) -> Result<String, ProtoError> {
        Ok(serde_json::to_string(self)?)
    }
}

impl Default for PingMessage {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of the `AUTH` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthDescriptor {
    /// Stable per-address identifier (UUID v5 of the local address)
    pub browser_id: Uuid,
    pub user_id: String,
    pub user_agent: String,
    /// Unix seconds
    pub timestamp: i64,
    pub device_type: String,
}

/// Payload of the `HTTP_REQUEST` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRelayRequest {
    pub url: String,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded request body
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub session_id: String,
    /// Include the session's cookies in the exchange
    #[serde(default)]
    pub authenticated: bool,
    /// Source address suggested by the coordinator (the connection's own address is used instead)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device_ip: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

/// Result of the `HTTP_REQUEST` action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRelayResponse {
    /// Final URL after redirects
    pub url: String,
    pub status: u16,
    pub status_text: String,
    pub headers: BTreeMap<String, String>,
    /// Base64-encoded response body
    pub body: String,
}
