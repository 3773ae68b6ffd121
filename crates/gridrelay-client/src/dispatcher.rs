//! RPC dispatch: maps an inbound action to its handler and builds the correlated response

use gridrelay_proto::{AuthDescriptor, HttpRelayRequest, RpcAction, RpcMessage, RpcResponse};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

use crate::allocator::ConnectionKey;
use crate::config::ClientConfig;
use crate::cookie_store::SessionCookieStore;
use crate::http_relay::{HttpRelay, RelayError};

/// Handler failures; no response is sent for these
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("invalid {action} payload: {source}")]
    InvalidPayload {
        action: RpcAction,
        source: serde_json::Error,
    },

    #[error("failed to encode result: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error(transparent)]
    Relay(#[from] RelayError),
}

/// `"vps, <os>, <arch>"`
pub fn platform_descriptor() -> String {
    format!(
        "vps, {}, {}",
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// Authentication descriptor for a connection. The browser id depends only on
/// the namespace and the local address, so it survives restarts.
pub fn build_auth_descriptor(
    namespace: &Uuid,
    key: &ConnectionKey,
    user_agent: &str,
    device_type: &str,
    timestamp: i64,
) -> AuthDescriptor {
    AuthDescriptor {
        browser_id: Uuid::new_v5(namespace, key.address.to_string().as_bytes()),
        user_id: key.identity.clone(),
        user_agent: user_agent.to_string(),
        timestamp,
        device_type: device_type.to_string(),
    }
}

/// Fixed action table: `HTTP_REQUEST`, `AUTH`, `PONG`
#[derive(Debug)]
pub struct Dispatcher {
    relay: HttpRelay,
    namespace: Uuid,
    user_agent: String,
    device_type: String,
}

impl Dispatcher {
    pub fn new(relay: HttpRelay, namespace: Uuid, user_agent: impl Into<String>) -> Self {
        Self {
            relay,
            namespace,
            user_agent: user_agent.into(),
            device_type: platform_descriptor(),
        }
    }

    /// Dispatcher with its own cookie store, sized from `config`
    pub fn from_config(config: &ClientConfig) -> Self {
        let cookies = SessionCookieStore::new(config.session_lifetime);
        let relay = HttpRelay::new(cookies, config.relay_timeout);
        Self::new(relay, config.namespace, config.user_agent.clone())
    }

    pub fn relay(&self) -> &HttpRelay {
        &self.relay
    }

    /// Run the handler for `message` on behalf of the connection `key`.
    ///
    /// `Ok(None)` means there is nothing to send back: keepalive acks, unknown
    /// actions and relays that failed at the network level.
    pub async fn dispatch(
        &self,
        message: RpcMessage,
        key: &ConnectionKey,
    ) -> Result<Option<RpcResponse>, DispatchError> {
        let RpcMessage { id, action, data } = message;

        let result = match &action {
            RpcAction::HttpRequest => {
                let request: HttpRelayRequest =
                    serde_json::from_value(data).map_err(|source| DispatchError::InvalidPayload {
                        action: action.clone(),
                        source,
                    })?;
                match self.relay.execute(request, key.address).await? {
                    Some(response) => {
                        Some(serde_json::to_value(response).map_err(DispatchError::Serialize)?)
                    }
                    None => None,
                }
            }
            RpcAction::Auth => {
                let descriptor = build_auth_descriptor(
                    &self.namespace,
                    key,
                    &self.user_agent,
                    &self.device_type,
                    chrono::Utc::now().timestamp(),
                );
                Some(serde_json::to_value(descriptor).map_err(DispatchError::Serialize)?)
            }
            RpcAction::Pong => None,
            RpcAction::Ping | RpcAction::Unknown(_) => {
                warn!("{} No RPC handler for action {}", key, action);
                None
            }
        };

        Ok(result
            .filter(|value| !value.is_null())
            .map(|value| RpcResponse::new(id, action, value)))
    }
}
