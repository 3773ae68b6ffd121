//! Per-session cookie jars with a bounded lifetime

use reqwest::cookie::Jar;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tracing::{debug, info};

struct SessionEntry {
    jar: Arc<Jar>,
    eviction: AbortHandle,
}

struct StoreInner {
    sessions: Mutex<HashMap<String, SessionEntry>>,
    lifetime: Duration,
}

impl StoreInner {
    fn lock(&self) -> MutexGuard<'_, HashMap<String, SessionEntry>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        let sessions = self.sessions.get_mut().unwrap_or_else(PoisonError::into_inner);
        for entry in sessions.values() {
            entry.eviction.abort();
        }
    }
}

/// Cookie jars keyed by session id.
///
/// A jar is created on first use and evicted once its lifetime has elapsed;
/// a later request for the same session starts from an empty jar. Dropping
/// the last clone of the store aborts all pending evictions.
#[derive(Clone)]
pub struct SessionCookieStore {
    inner: Arc<StoreInner>,
}

impl std::fmt::Debug for SessionCookieStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCookieStore")
            .field("sessions", &self.len())
            .field("lifetime", &self.inner.lifetime)
            .finish()
    }
}

impl SessionCookieStore {
    pub fn new(lifetime: Duration) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                sessions: Mutex::new(HashMap::new()),
                lifetime,
            }),
        }
    }

    /// Jar for `session_id`, created (and scheduled for eviction) if absent.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn get_or_create(&self, session_id: &str) -> Arc<Jar> {
        let mut sessions = self.inner.lock();

        if let Some(entry) = sessions.get(session_id) {
            return entry.jar.clone();
        }

        let jar = Arc::new(Jar::default());
        let eviction = tokio::spawn(Self::evict_after(
            Arc::downgrade(&self.inner),
            session_id.to_string(),
            Arc::downgrade(&jar),
        ))
        .abort_handle();

        sessions.insert(
            session_id.to_string(),
            SessionEntry {
                jar: jar.clone(),
                eviction,
            },
        );
        debug!("[COOKIE] Created jar for session {}", session_id);

        jar
    }

    /// Jar for `session_id` if one is live
    pub fn get(&self, session_id: &str) -> Option<Arc<Jar>> {
        self.inner
            .lock()
            .get(session_id)
            .map(|entry| entry.jar.clone())
    }

    pub fn contains(&self, session_id: &str) -> bool {
        self.inner.lock().contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    async fn evict_after(store: Weak<StoreInner>, session_id: String, jar: Weak<Jar>) {
        let Some(lifetime) = store.upgrade().map(|inner| inner.lifetime) else {
            return;
        };

        tokio::time::sleep(lifetime).await;

        let Some(inner) = store.upgrade() else {
            return;
        };
        let mut sessions = inner.lock();

        // Only remove the jar this timer was created for
        let owned = sessions
            .get(&session_id)
            .is_some_and(|entry| std::ptr::eq(Arc::as_ptr(&entry.jar), jar.as_ptr()));
        if owned {
            sessions.remove(&session_id);
            info!("[COOKIE] Jar for session {} evicted", session_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::cookie::CookieStore;
    use reqwest::header::HeaderValue;

    const LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

    #[tokio::test]
    async fn test_same_session_same_jar() {
        let store = SessionCookieStore::new(LIFETIME);

        let first = store.get_or_create("s1");
        let second = store.get_or_create("s1");
        let other = store.get_or_create("s2");

        assert!(Arc::ptr_eq(&first, &second));
        assert!(!Arc::ptr_eq(&first, &other));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_creation_yields_one_jar() {
        let store = SessionCookieStore::new(LIFETIME);

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let store = store.clone();
                tokio::spawn(async move { store.get_or_create("shared") })
            })
            .collect();

        let mut jars = Vec::new();
        for handle in handles {
            jars.push(handle.await.unwrap());
        }

        assert!(jars.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
        assert_eq!(store.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_jar_evicted_after_lifetime() {
        let store = SessionCookieStore::new(LIFETIME);
        let url: url::Url = "https://example.com/".parse().unwrap();

        let jar = store.get_or_create("s1");
        jar.set_cookies(
            &mut [HeaderValue::from_static("sid=abc")].iter(),
            &url,
        );
        assert!(jar.cookies(&url).is_some());

        tokio::time::sleep(LIFETIME - Duration::from_secs(1)).await;
        assert!(store.contains("s1"));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.contains("s1"));
        assert!(store.get("s1").is_none());

        let fresh = store.get_or_create("s1");
        assert!(!Arc::ptr_eq(&jar, &fresh));
        assert!(fresh.cookies(&url).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sessions_expire_independently() {
        let store = SessionCookieStore::new(Duration::from_secs(10));

        store.get_or_create("early");
        tokio::time::sleep(Duration::from_secs(5)).await;
        store.get_or_create("late");

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(!store.contains("early"));
        assert!(store.contains("late"));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(store.is_empty());
    }
}
