//! In-process transport
//!
//! Every successful `connect` produces a [`FrameLink`] for the node and a
//! matching [`MemoryPeer`] that plays the coordinator. Peers are handed out
//! through the receiver returned by [`MemoryConnector::new`].

use async_trait::async_trait;
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use crate::{
    FrameConnector, FrameLink, FrameSender, InboundFrame, OutboundFrame, TransportError,
    TransportResult,
};

const CHANNEL_CAPACITY: usize = 64;

/// Connector that wires links to in-memory peers
#[derive(Debug)]
pub struct MemoryConnector {
    peers: mpsc::UnboundedSender<MemoryPeer>,
    pending_failures: AtomicUsize,
    attempts: AtomicUsize,
}

impl MemoryConnector {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<MemoryPeer>) {
        let (peers, peers_rx) = mpsc::unbounded_channel();
        (
            Self {
                peers,
                pending_failures: AtomicUsize::new(0),
                attempts: AtomicUsize::new(0),
            },
            peers_rx,
        )
    }

    /// Make the next `count` connection attempts fail
    pub fn fail_next(&self, count: usize) {
        self.pending_failures.store(count, Ordering::SeqCst);
    }

    /// Number of `connect` calls so far, failed ones included
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl FrameConnector for MemoryConnector {
    async fn connect(&self, endpoint: &str, local_addr: IpAddr) -> TransportResult<FrameLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);

        let failed = self
            .pending_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(TransportError::ConnectionError(format!(
                "connection to {} refused",
                endpoint
            )));
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (inbound_tx, inbound_rx) = mpsc::channel(CHANNEL_CAPACITY);

        let peer = MemoryPeer {
            endpoint: endpoint.to_string(),
            local_addr,
            outbound: outbound_rx,
            inbound: inbound_tx,
        };
        self.peers
            .send(peer)
            .map_err(|_| TransportError::ConnectionError("no coordinator listening".into()))?;

        Ok(FrameLink::new(FrameSender::new(outbound_tx), inbound_rx))
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Coordinator side of an in-memory link
#[derive(Debug)]
pub struct MemoryPeer {
    pub endpoint: String,
    pub local_addr: IpAddr,
    outbound: mpsc::Receiver<OutboundFrame>,
    inbound: mpsc::Sender<TransportResult<InboundFrame>>,
}

impl MemoryPeer {
    /// Deliver a text frame to the node. Returns false if the node dropped the link.
    pub async fn send_text(&self, text: impl Into<String>) -> bool {
        self.inbound
            .send(Ok(InboundFrame::Text(text.into())))
            .await
            .is_ok()
    }

    /// Deliver a transport error to the node
    pub async fn send_error(&self, message: &str) -> bool {
        self.inbound
            .send(Err(TransportError::ConnectionError(message.to_string())))
            .await
            .is_ok()
    }

    /// Close the link from the coordinator side
    pub async fn close(&self, code: u16, reason: &str) -> bool {
        self.inbound
            .send(Ok(InboundFrame::Closed {
                code: Some(code),
                reason: reason.to_string(),
            }))
            .await
            .is_ok()
    }

    /// Next frame written by the node, `None` once its writer is gone
    pub async fn recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.recv().await
    }

    pub fn try_recv(&mut self) -> Option<OutboundFrame> {
        self.outbound.try_recv().ok()
    }
}
