//! One persistent coordinator connection for an (identity, address) pair
//!
//! A connection runs as two tasks sharing a cancellation token:
//!
//! - the **io task** performs the handshake, then reads frames in arrival
//!   order and spawns one dispatch task per parsed message;
//! - the **keepalive task** ticks every keepalive interval, pings a healthy
//!   link and reports a stale or closed one to the supervisor, which replaces
//!   the whole connection with a new generation.
//!
//! Neither task ever restarts the connection itself.

use gridrelay_proto::{PingMessage, RpcAction, RpcMessage};
use gridrelay_transport::{
    FrameConnector, FrameSender, InboundFrame, LinkState, SharedLinkState,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::allocator::ConnectionKey;
use crate::dispatcher::Dispatcher;
use crate::status::StatusAggregator;

/// Event sent from a connection to its supervisor
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum ConnectionEvent {
    /// The connection went silent or closed and has torn itself down
    Stale { key: ConnectionKey, generation: u64 },
}

/// State shared by every connection of one supervisor
#[derive(Debug)]
pub(crate) struct ConnectionShared {
    pub connector: Arc<dyn FrameConnector>,
    pub dispatcher: Arc<Dispatcher>,
    pub status: StatusAggregator,
    pub endpoints: Vec<String>,
    pub keepalive_interval: Duration,
    pub stale_threshold: Duration,
    /// Process-wide transport error count, also used to rotate endpoints
    pub retries: AtomicUsize,
    pub events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl ConnectionShared {
    fn next_endpoint(&self) -> &str {
        let retries = self.retries.load(Ordering::SeqCst);
        &self.endpoints[retries % self.endpoints.len()]
    }

    fn record_error(&self) {
        self.retries.fetch_add(1, Ordering::SeqCst);
    }
}

/// Time of the most recent inbound traffic
#[derive(Debug)]
struct LastLive(Mutex<Instant>);

impl LastLive {
    fn new() -> Self {
        Self(Mutex::new(Instant::now()))
    }

    fn refresh(&self) {
        let mut last = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        *last = (*last).max(Instant::now());
    }

    fn elapsed(&self) -> Duration {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).elapsed()
    }
}

/// Handle to a running connection. Dropping it tears the connection down.
#[derive(Debug)]
pub struct ConnectionHandle {
    key: ConnectionKey,
    generation: u64,
    state: SharedLinkState,
    last_live: Arc<LastLive>,
    cancel: CancellationToken,
    io_task: JoinHandle<()>,
    keepalive_task: JoinHandle<()>,
}

impl ConnectionHandle {
    pub fn key(&self) -> &ConnectionKey {
        &self.key
    }

    /// Distinguishes successive connections of the same pair
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn state(&self) -> LinkState {
        self.state.get()
    }

    pub fn seconds_since_last_live(&self) -> u64 {
        self.last_live.elapsed().as_secs()
    }

    /// Close the transport and cancel the keepalive timer
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Shut down and wait for both tasks to finish
    pub async fn join(mut self) {
        self.shutdown();
        let _ = (&mut self.io_task).await;
        let _ = (&mut self.keepalive_task).await;
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// The tasks' view of one connection
#[derive(Clone)]
pub(crate) struct Connection {
    key: ConnectionKey,
    generation: u64,
    state: SharedLinkState,
    last_live: Arc<LastLive>,
    sender: Arc<OnceLock<FrameSender>>,
    cancel: CancellationToken,
    shared: Arc<ConnectionShared>,
}

impl Connection {
    /// Start a brand-new connection in the Connecting state
    pub(crate) fn spawn(
        key: ConnectionKey,
        generation: u64,
        shared: Arc<ConnectionShared>,
    ) -> ConnectionHandle {
        let connection = Connection {
            key: key.clone(),
            generation,
            state: SharedLinkState::new(LinkState::Connecting),
            last_live: Arc::new(LastLive::new()),
            sender: Arc::new(OnceLock::new()),
            cancel: CancellationToken::new(),
            shared,
        };

        let state = connection.state.clone();
        let last_live = connection.last_live.clone();
        let cancel = connection.cancel.clone();

        let keepalive_task = tokio::spawn(connection.clone().run_keepalive());
        let io_task = tokio::spawn(connection.run_io());

        ConnectionHandle {
            key,
            generation,
            state,
            last_live,
            cancel,
            io_task,
            keepalive_task,
        }
    }

    async fn run_io(self) {
        let endpoint = self.shared.next_endpoint().to_string();
        debug!("{} Connecting to {} (generation {})", self.key, endpoint, self.generation);

        let connect = self.shared.connector.connect(&endpoint, self.key.address);
        let link = tokio::select! {
            _ = self.cancel.cancelled() => {
                self.state.set(LinkState::Closed);
                return;
            }
            result = connect => result,
        };

        let (sender, mut receiver) = match link {
            Ok(link) => link.into_parts(),
            Err(e) => {
                self.shared.record_error();
                error!("{} [connection error] {}", self.key, e);
                self.go_offline();
                return;
            }
        };

        let _ = self.sender.set(sender.clone());
        self.last_live.refresh();
        self.state.set(LinkState::Open);
        info!("{} WebSocket open ({})", self.key, endpoint);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    self.state.begin_close();
                    sender.close();
                    debug!("{} Connection torn down", self.key);
                    self.go_offline();
                    break;
                }
                frame = receiver.recv() => match frame {
                    Some(Ok(InboundFrame::Text(text))) => self.handle_payload(text.as_bytes()),
                    Some(Ok(InboundFrame::Binary(data))) => self.handle_payload(&data),
                    Some(Ok(InboundFrame::Closed { code, reason })) => {
                        info!(
                            "{} Connection closed, code={}, reason={}",
                            self.key,
                            code.map(|c| c.to_string()).unwrap_or_else(|| "none".to_string()),
                            reason
                        );
                        self.go_offline();
                        break;
                    }
                    Some(Err(e)) => {
                        self.shared.record_error();
                        error!("{} [connection error] {}", self.key, e);
                        self.go_offline();
                        break;
                    }
                    None => {
                        info!("{} Connection closed by transport", self.key);
                        self.go_offline();
                        break;
                    }
                }
            }
        }
    }

    fn go_offline(&self) {
        self.state.set(LinkState::Closed);
        self.shared.status.mark_offline(&self.key.identity);
    }

    fn handle_payload(&self, payload: &[u8]) {
        self.last_live.refresh();

        let message = match RpcMessage::parse_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "{} Unable to parse message ({}): {}",
                    self.key,
                    e,
                    String::from_utf8_lossy(&payload[..payload.len().min(256)])
                );
                return;
            }
        };

        if message.action == RpcAction::Auth {
            self.shared.status.mark_online(&self.key.identity);
        }

        info!("{} 📩 Received action {}", self.key, message.action);

        let connection = self.clone();
        tokio::spawn(async move { connection.dispatch(message).await });
    }

    async fn dispatch(self, message: RpcMessage) {
        let action = message.action.clone();

        let response = match self.shared.dispatcher.dispatch(message, &self.key).await {
            Ok(Some(response)) => response,
            Ok(None) => return,
            Err(e) => {
                error!("{} RPC {} failed: {}", self.key, action, e);
                return;
            }
        };

        if self.state.get() != LinkState::Open {
            debug!("{} Dropping {} response, connection gone", self.key, action);
            return;
        }
        let Some(sender) = self.sender.get() else {
            return;
        };

        match response.to_text() {
            Ok(text) => {
                if let Err(e) = sender.send_text(text).await {
                    debug!("{} Dropping {} response: {}", self.key, action, e);
                }
            }
            Err(e) => error!("{} Failed to encode {} response: {}", self.key, action, e),
        }
    }

    async fn run_keepalive(self) {
        let interval = self.shared.keepalive_interval;
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("{} Keepalive timer cancelled", self.key);
                    return;
                }
                _ = ticker.tick() => {}
            }

            let state = self.state.get();
            if state.is_pending() {
                info!("{} Link not in a state for a liveness check ({:?})", self.key, state);
                continue;
            }

            let silent_for = self.last_live.elapsed();
            if silent_for > self.shared.stale_threshold || state == LinkState::Closed {
                warn!(
                    "{} Connection looks dead (silent for {}s, {:?}), restarting",
                    self.key,
                    silent_for.as_secs(),
                    state
                );
                self.cancel.cancel();
                let event = ConnectionEvent::Stale {
                    key: self.key.clone(),
                    generation: self.generation,
                };
                if self.shared.events.send(event).is_err() {
                    debug!("{} Supervisor gone, not restarting", self.key);
                }
                return;
            }

            let Some(sender) = self.sender.get() else {
                continue;
            };
            match PingMessage::new().to_text() {
                Ok(text) => {
                    if let Err(e) = sender.send_text(text).await {
                        debug!("{} Ping not sent: {}", self.key, e);
                    }
                }
                Err(e) => error!("{} Failed to encode ping: {}", self.key, e),
            }
        }
    }
}
