//! Connection supervisor: keeps one live connection per (identity, address) pair
//!
//! Connections report staleness over a channel; the supervisor answers by
//! shutting the old generation down completely and spawning a fresh one.

use gridrelay_transport::{FrameConnector, LinkState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::allocator::ConnectionKey;
use crate::config::ClientConfig;
use crate::connection::{Connection, ConnectionEvent, ConnectionHandle, ConnectionShared};
use crate::dispatcher::Dispatcher;
use crate::status::StatusAggregator;

struct SupervisorInner {
    shared: Arc<ConnectionShared>,
    registry: Mutex<HashMap<ConnectionKey, ConnectionHandle>>,
    next_generation: AtomicU64,
    shutdown: CancellationToken,
}

impl SupervisorInner {
    fn registry(&self) -> MutexGuard<'_, HashMap<ConnectionKey, ConnectionHandle>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn spawn_connection(&self, key: &ConnectionKey) -> ConnectionHandle {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        Connection::spawn(key.clone(), generation, self.shared.clone())
    }
}

impl Drop for SupervisorInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Owns every connection of the process
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("connections", &self.connection_count())
            .field("retries", &self.retries())
            .finish()
    }
}

impl Supervisor {
    /// Create a supervisor. Must be called from within a Tokio runtime.
    pub fn new(
        config: &ClientConfig,
        connector: Arc<dyn FrameConnector>,
        dispatcher: Arc<Dispatcher>,
        status: StatusAggregator,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(ConnectionShared {
            connector,
            dispatcher,
            status,
            endpoints: config.endpoints.clone(),
            keepalive_interval: config.keepalive_interval,
            stale_threshold: config.stale_threshold,
            retries: AtomicUsize::new(0),
            events: events_tx,
        });

        let inner = Arc::new(SupervisorInner {
            shared,
            registry: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(Self::control_loop(
            Arc::downgrade(&inner),
            inner.shutdown.clone(),
            events_rx,
        ));

        Self { inner }
    }

    async fn control_loop(
        inner: Weak<SupervisorInner>,
        shutdown: CancellationToken,
        mut events: mpsc::UnboundedReceiver<ConnectionEvent>,
    ) {
        loop {
            let event = tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            let Some(inner) = inner.upgrade() else {
                break;
            };
            let supervisor = Supervisor { inner };

            match event {
                ConnectionEvent::Stale { key, generation } => {
                    supervisor.restart(&key, generation).await;
                }
            }
        }
        debug!("Supervisor control loop stopped");
    }

    /// Start a brand-new connection for `key`, replacing any existing one
    pub fn start(&self, key: ConnectionKey) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let handle = self.inner.spawn_connection(&key);
        info!("{} Starting connection (generation {})", key, handle.generation());

        if let Some(previous) = self.inner.registry().insert(key, handle) {
            previous.shutdown();
        }
    }

    /// Start every pair in `plan`, waiting `delay` between consecutive starts
    pub async fn start_all(&self, plan: Vec<ConnectionKey>, delay: Duration) {
        for (index, key) in plan.into_iter().enumerate() {
            if index > 0 && !delay.is_zero() {
                tokio::select! {
                    _ = self.inner.shutdown.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            self.start(key);
        }
    }

    /// Replace generation `generation` of `key` with a new connection.
    ///
    /// Does nothing if that generation is no longer the registered one.
    pub async fn restart(&self, key: &ConnectionKey, generation: u64) {
        let previous = {
            let mut registry = self.inner.registry();
            match registry.get(key) {
                Some(handle) if handle.generation() == generation => registry.remove(key),
                _ => None,
            }
        };
        let Some(previous) = previous else {
            debug!("{} Generation {} already replaced", key, generation);
            return;
        };

        previous.join().await;

        if self.inner.shutdown.is_cancelled() {
            return;
        }

        let handle = self.inner.spawn_connection(key);
        info!(
            "{} Restarted connection (generation {} -> {})",
            key,
            generation,
            handle.generation()
        );

        let mut registry = self.inner.registry();
        if registry.contains_key(key) {
            // Someone started the pair while the old generation was draining
            handle.shutdown();
        } else {
            registry.insert(key.clone(), handle);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.registry().len()
    }

    /// Generation of the connection currently registered for `key`
    pub fn generation_of(&self, key: &ConnectionKey) -> Option<u64> {
        self.inner.registry().get(key).map(ConnectionHandle::generation)
    }

    pub fn state_of(&self, key: &ConnectionKey) -> Option<LinkState> {
        self.inner.registry().get(key).map(ConnectionHandle::state)
    }

    /// Transport errors seen so far across all connections
    pub fn retries(&self) -> usize {
        self.inner.shared.retries.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> &StatusAggregator {
        &self.inner.shared.status
    }

    /// Tear every connection down and wait for their tasks to finish
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();

        let handles: Vec<ConnectionHandle> = self
            .inner
            .registry()
            .drain()
            .map(|(_, handle)| handle)
            .collect();

        info!("Shutting down {} connection(s)", handles.len());
        for handle in handles {
            handle.join().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridrelay_transport::memory::MemoryConnector;

    fn config() -> ClientConfig {
        ClientConfig::builder()
            .identity("u1")
            .endpoints(["wss://a.example:1", "wss://b.example:2"])
            .build()
            .unwrap()
    }

    fn key(identity: &str) -> ConnectionKey {
        ConnectionKey::new(identity, "10.0.0.1".parse().unwrap())
    }

    #[tokio::test]
    async fn test_start_replaces_existing_connection() {
        let config = config();
        let (connector, mut peers) = MemoryConnector::new();
        let supervisor = Supervisor::new(
            &config,
            Arc::new(connector),
            Arc::new(Dispatcher::from_config(&config)),
            StatusAggregator::new(1),
        );

        supervisor.start(key("u1"));
        let first = supervisor.generation_of(&key("u1")).unwrap();
        let _peer = peers.recv().await.unwrap();

        supervisor.start(key("u1"));
        let second = supervisor.generation_of(&key("u1")).unwrap();

        assert!(second > first);
        assert_eq!(supervisor.connection_count(), 1);

        supervisor.shutdown().await;
        assert_eq!(supervisor.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_restart_ignores_old_generation() {
        let config = config();
        let (connector, _peers) = MemoryConnector::new();
        let supervisor = Supervisor::new(
            &config,
            Arc::new(connector),
            Arc::new(Dispatcher::from_config(&config)),
            StatusAggregator::new(1),
        );

        supervisor.start(key("u1"));
        let current = supervisor.generation_of(&key("u1")).unwrap();

        supervisor.restart(&key("u1"), current + 100).await;
        assert_eq!(supervisor.generation_of(&key("u1")), Some(current));

        supervisor.restart(&key("u1"), current).await;
        assert!(supervisor.generation_of(&key("u1")).unwrap() > current);

        supervisor.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_starts_after_shutdown() {
        let config = config();
        let (connector, _peers) = MemoryConnector::new();
        let supervisor = Supervisor::new(
            &config,
            Arc::new(connector),
            Arc::new(Dispatcher::from_config(&config)),
            StatusAggregator::new(1),
        );

        supervisor.shutdown().await;
        supervisor.start(key("u1"));
        assert_eq!(supervisor.connection_count(), 0);
    }
}
