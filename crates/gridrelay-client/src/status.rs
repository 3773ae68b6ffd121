//! Online identity bookkeeping

use serde::Serialize;
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::info;

#[derive(Debug, Default)]
struct Overview {
    total: usize,
    online: Vec<String>,
}

/// Read-only view of the overview
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OverviewSnapshot {
    pub total: usize,
    pub online: usize,
    pub remaining: usize,
    pub online_identities: Vec<String>,
}

impl fmt::Display for OverviewSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "total={} online={} remaining={}",
            self.total, self.online, self.remaining
        )
    }
}

/// Tracks which identities are online. Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct StatusAggregator {
    inner: Arc<Mutex<Overview>>,
}

impl StatusAggregator {
    pub fn new(total: usize) -> Self {
        let aggregator = Self::default();
        aggregator.set_total(total);
        aggregator
    }

    pub fn set_total(&self, total: usize) {
        self.lock().total = total;
    }

    /// Record `identity` as online. Returns false if it already was.
    pub fn mark_online(&self, identity: &str) -> bool {
        let snapshot = {
            let mut overview = self.lock();
            if overview.online.iter().any(|i| i == identity) {
                return false;
            }
            overview.online.push(identity.to_string());
            Self::snapshot_of(&overview)
        };

        info!("📊 [{}] online: {}", identity, snapshot);
        true
    }

    /// Remove `identity` from the online set. Returns false if it was not online.
    pub fn mark_offline(&self, identity: &str) -> bool {
        let mut overview = self.lock();
        match overview.online.iter().position(|i| i == identity) {
            Some(index) => {
                overview.online.remove(index);
                true
            }
            None => false,
        }
    }

    pub fn is_online(&self, identity: &str) -> bool {
        self.lock().online.iter().any(|i| i == identity)
    }

    pub fn snapshot(&self) -> OverviewSnapshot {
        Self::snapshot_of(&self.lock())
    }

    fn snapshot_of(overview: &Overview) -> OverviewSnapshot {
        OverviewSnapshot {
            total: overview.total,
            online: overview.online.len(),
            remaining: overview.total.saturating_sub(overview.online.len()),
            online_identities: overview.online.clone(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Overview> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
