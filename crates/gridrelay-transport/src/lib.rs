//! Transport abstraction layer for coordinator connections
//!
//! The engine never talks to a socket directly. A [`FrameConnector`] opens a
//! connection from a given local source address and hands back a [`FrameLink`]:
//! a sending half for outbound text frames and a receiving half that yields
//! inbound frames until the peer goes away.
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │        Connection supervisor (client)         │
//! └──────────────────────────────────────────────┘
//!                       │ FrameConnector::connect
//!                       ↓
//! ┌──────────────────────┬───────────────────────┐
//! │ gridrelay-transport- │  memory (in-process,  │
//! │ websocket (wss://)   │  used by tests)       │
//! └──────────────────────┴───────────────────────┘
//! ```

pub mod memory;

use async_trait::async_trait;
use std::fmt::Debug;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::trace;

/// Transport-level errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Connection error: {0}")]
    ConnectionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Link closed")]
    LinkClosed,

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Timeout")]
    Timeout,

    #[error("TLS error: {0}")]
    TlsError(String),

    #[error("Configuration error: {0}")]
    ConfigurationError(String),
}

/// Result type for transport operations
pub type TransportResult<T> = Result<T, TransportError>;

/// Lifecycle of a link, numbered like the WebSocket ready states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LinkState {
    Connecting = 0,
    Open = 1,
    Closing = 2,
    Closed = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => LinkState::Connecting,
            1 => LinkState::Open,
            2 => LinkState::Closing,
            _ => LinkState::Closed,
        }
    }

    /// States in which a liveness check cannot say anything useful
    pub fn is_pending(self) -> bool {
        matches!(self, LinkState::Connecting | LinkState::Closing)
    }
}

/// Link state shared between a connection's tasks
#[derive(Debug, Clone)]
pub struct SharedLinkState(Arc<AtomicU8>);

impl SharedLinkState {
    pub fn new(state: LinkState) -> Self {
        Self(Arc::new(AtomicU8::new(state as u8)))
    }

    pub fn get(&self) -> LinkState {
        LinkState::from_u8(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: LinkState) {
        self.0.store(state as u8, Ordering::SeqCst);
    }

    /// Move to `Closing` unless the link is already closed
    pub fn begin_close(&self) {
        let _ = self.0.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
            (current != LinkState::Closed as u8).then_some(LinkState::Closing as u8)
        });
    }
}

/// A frame delivered by the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Text(String),
    Binary(Vec<u8>),
    /// Peer closed the link; no more frames follow
    Closed { code: Option<u16>, reason: String },
}

/// A frame queued for the remote peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Text(String),
    Close,
}

/// Sending half of a link. Cheap to clone; every clone feeds the same writer.
#[derive(Debug, Clone)]
pub struct FrameSender {
    tx: mpsc::Sender<OutboundFrame>,
}

impl FrameSender {
    pub fn new(tx: mpsc::Sender<OutboundFrame>) -> Self {
        Self { tx }
    }

    /// Queue a text frame
    pub async fn send_text(&self, text: String) -> TransportResult<()> {
        self.tx
            .send(OutboundFrame::Text(text))
            .await
            .map_err(|_| TransportError::LinkClosed)
    }

    /// Ask the writer to close the link. Never waits; a full or gone queue is ignored.
    pub fn close(&self) {
        if let Err(e) = self.tx.try_send(OutboundFrame::Close) {
            trace!("Close request not queued: {}", e);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// An established link to the coordinator
#[derive(Debug)]
pub struct FrameLink {
    pub sender: FrameSender,
    pub receiver: mpsc::Receiver<TransportResult<InboundFrame>>,
}

impl FrameLink {
    pub fn new(
        sender: FrameSender,
        receiver: mpsc::Receiver<TransportResult<InboundFrame>>,
    ) -> Self {
        Self { sender, receiver }
    }

    /// Split into the sending half and the inbound frame stream
    pub fn into_parts(
        self,
    ) -> (
        FrameSender,
        mpsc::Receiver<TransportResult<InboundFrame>>,
    ) {
        (self.sender, self.receiver)
    }
}

/// Client-side: establishes outgoing links to a coordinator endpoint
#[async_trait]
pub trait FrameConnector: Send + Sync + Debug {
    /// Connect to `endpoint` (a `ws://` or `wss://` URL) using `local_addr` as the source address
    async fn connect(&self, endpoint: &str, local_addr: IpAddr) -> TransportResult<FrameLink>;

    /// Human-readable transport name
    fn name(&self) -> &str;
}
