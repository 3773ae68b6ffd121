//! Gridrelay client engine - Public API
//!
//! Keeps one persistent coordinator connection per (identity, local address)
//! pair and answers the coordinator's RPCs, relaying HTTP requests from the
//! connection's own source address.

pub mod address_pool;
pub mod allocator;
pub mod config;
pub mod connection;
pub mod cookie_store;
pub mod dispatcher;
pub mod http_relay;
pub mod status;
pub mod supervisor;

pub use address_pool::{resolve_local_addresses, select_addresses};
pub use allocator::{allocate, Allocation, AllocationError, ConnectionKey};
pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use connection::ConnectionHandle;
pub use cookie_store::SessionCookieStore;
pub use dispatcher::{build_auth_descriptor, DispatchError, Dispatcher};
pub use http_relay::{prettify_header_name, HttpRelay, RelayError};
pub use status::{OverviewSnapshot, StatusAggregator};
pub use supervisor::Supervisor;

pub use gridrelay_proto::{HttpRelayRequest, HttpRelayResponse, RpcAction, RpcMessage};
