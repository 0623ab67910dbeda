//! TTL+LRU cache of upstream tool schemas, keyed by upstream id.

use std::collections::HashMap;
use std::time::Duration;
use std::time::Instant;

use metrics::counter;
use tokio::sync::Mutex;

use conduit_protocol::ToolStub;

pub const DEFAULT_SCHEMA_CAPACITY: usize = 128;
pub const DEFAULT_SCHEMA_TTL: Duration = Duration::from_secs(60 * 60);

const HITS_METRIC: &str = "conduit_schema_cache_hits_total";
const MISSES_METRIC: &str = "conduit_schema_cache_misses_total";

#[derive(Debug)]
struct Entry {
    tools: Vec<ToolStub>,
    inserted_at: Instant,
    last_used: Instant,
}

#[derive(Debug)]
pub struct SchemaCache {
    capacity: usize,
    ttl: Duration,
    entries: Mutex<HashMap<String, Entry>>,
}

impl Default for SchemaCache {
    fn default() -> Self {
        Self::new(DEFAULT_SCHEMA_CAPACITY, DEFAULT_SCHEMA_TTL)
    }
}

impl SchemaCache {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            entries: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get(&self, upstream_id: &str) -> Option<Vec<ToolStub>> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < self.ttl);
        match entries.get_mut(upstream_id) {
            Some(entry) => {
                entry.last_used = now;
                counter!(HITS_METRIC).increment(1);
                Some(entry.tools.clone())
            }
            None => {
                counter!(MISSES_METRIC).increment(1);
                None
            }
        }
    }

    pub async fn set(&self, upstream_id: &str, tools: Vec<ToolStub>) {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        entries.retain(|_, entry| now.duration_since(entry.inserted_at) < self.ttl);
        if entries.len() >= self.capacity && !entries.contains_key(upstream_id) {
            if let Some(victim) = entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(id, _)| id.clone())
            {
                entries.remove(&victim);
            }
        }
        entries.insert(
            upstream_id.to_string(),
            Entry {
                tools,
                inserted_at: now,
                last_used: now,
            },
        );
    }

    /// Drop the cached listing for one upstream (e.g. after a transport
    /// timeout suggests the upstream changed underneath us).
    pub async fn invalidate(&self, upstream_id: &str) {
        self.entries.lock().await.remove(upstream_id);
    }

    pub async fn clear(&self) {
        self.entries.lock().await.clear();
    }
}
