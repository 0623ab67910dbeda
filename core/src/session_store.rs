//! Short-lived per-execution capability tokens.
//!
//! A session is minted strictly before its sandbox spawns and invalidated
//! strictly after the sandbox exits; its allowlist is frozen at mint time.
//! Tokens are uuid-v4 strings (122 random bits), so concurrent duplicate
//! creation is not a practical concern.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use tokio::sync::Mutex;
use uuid::Uuid;

pub const DEFAULT_SESSION_CAPACITY: usize = 10_000;
pub const DEFAULT_SESSION_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone)]
pub struct Session {
    pub token: String,
    pub allowed_tools: Option<Vec<String>>,
    pub created_at: Instant,
}

#[derive(Debug)]
struct Entry {
    session: Session,
    last_used: Instant,
}

#[derive(Debug)]
pub struct SessionStore {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY, DEFAULT_SESSION_TTL)
    }
}

impl SessionStore {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn create(&self, allowed_tools: Option<Vec<String>>) -> String {
        let token = Uuid::new_v4().to_string();
        let now = Instant::now();
        let session = Session {
            token: token.clone(),
            allowed_tools,
            created_at: now,
        };
        let mut entries = self.entries.lock().await;
        Self::purge_locked(&mut entries, self.ttl, now);
        if entries.len() >= self.capacity {
            // Evict the least recently used entry to make room.
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(token, _)| token.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            token.clone(),
            Entry {
                session,
                last_used: now,
            },
        );
        token
    }

    pub async fn get(&self, token: &str) -> Option<Session> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Self::purge_locked(&mut entries, self.ttl, now);
        let entry = entries.get_mut(token)?;
        entry.last_used = now;
        Some(entry.session.clone())
    }

    pub async fn invalidate(&self, token: &str) {
        self.entries.lock().await.remove(token);
    }

    /// Periodic sweep; also runs opportunistically on each access.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Self::purge_locked(&mut entries, self.ttl, now);
    }

    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn purge_locked(entries: &mut HashMap<String, Entry>, ttl: Duration, now: Instant) {
        entries.retain(|_, entry| now.duration_since(entry.session.created_at) < ttl);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn create_then_get_then_invalidate() {
        let store = SessionStore::default();
        let token = store.create(Some(vec!["mock.*".to_string()])).await;
        let session = store.get(&token).await.expect("session must exist");
        assert_eq!(session.allowed_tools, Some(vec!["mock.*".to_string()]));

        store.invalidate(&token).await;
        assert!(store.get(&token).await.is_none());
    }

    #[tokio::test]
    async fn tokens_are_unique_and_opaque() {
        let store = SessionStore::default();
        let a = store.create(None).await;
        let b = store.create(None).await;
        assert_ne!(a, b);
        // uuid-v4 string form: 36 chars, 122 bits of entropy.
        assert_eq!(a.len(), 36);
    }

    #[tokio::test]
    async fn expired_sessions_are_purged_on_access() {
        let store = SessionStore::new(16, Duration::from_millis(0));
        let token = store.create(None).await;
        assert!(store.get(&token).await.is_none());
    }

    #[tokio::test]
    async fn capacity_evicts_least_recently_used() {
        let store = SessionStore::new(2, Duration::from_secs(3600));
        let a = store.create(None).await;
        let b = store.create(None).await;
        // Touch `a` so `b` becomes the LRU victim.
        assert!(store.get(&a).await.is_some());
        let c = store.create(None).await;
        assert!(store.get(&a).await.is_some());
        assert!(store.get(&b).await.is_none());
        assert!(store.get(&c).await.is_some());
    }
}
