//! Result cache: bounded-memory storage of read-only query results
//!
//! Entries are keyed by connection id plus normalized SQL text and evicted
//! least-recently-accessed first once the memory budget would be exceeded.
//! The cache does not inspect statements; callers decide what is eligible.
use crate::core::db::{normalize, ResultSet};
use crate::core::lock;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tracing::debug;

/// Cache fingerprint: connection id plus normalized SQL text
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    connection_id: String,
    sql: String,
}

impl CacheKey {
    pub fn new(connection_id: &str, sql: &str) -> Self {
        CacheKey {
            connection_id: connection_id.to_string(),
            sql: normalize(sql),
        }
    }

    pub fn connection_id(&self) -> &str {
        &self.connection_id
    }

    fn size_bytes(&self) -> usize {
        self.connection_id.len() + self.sql.len()
    }
}

/// Cache statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub eviction_count: u64,
    pub entry_count: usize,
    pub memory_usage_bytes: usize,
    pub max_memory_bytes: usize,
}

#[derive(Debug)]
struct CacheEntry {
    result: Arc<ResultSet>,
    size_bytes: usize,
    /// Position in the access order; larger is more recent
    last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// last_access tick -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    memory_usage: usize,
    clock: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        self.memory_usage -= entry.size_bytes;
        Some(entry)
    }

    fn evict_oldest(&mut self) -> bool {
        let Some((_, key)) = self.recency.pop_first() else {
            return false;
        };
        if let Some(entry) = self.entries.remove(&key) {
            self.memory_usage -= entry.size_bytes;
            self.evictions += 1;
            debug!(
                connection_id = key.connection_id(),
                size_bytes = entry.size_bytes,
                "Evicted cache entry"
            );
        }
        true
    }
}

pub struct ResultCache {
    state: Mutex<CacheState>,
    max_memory_bytes: usize,
}

impl ResultCache {
    pub fn new(max_memory_bytes: usize) -> Self {
        Self {
            state: Mutex::new(CacheState::default()),
            max_memory_bytes,
        }
    }

    /// Returns the cached result and marks it most recently used
    pub fn get(&self, key: &CacheKey) -> Option<Arc<ResultSet>> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        let tick = state.tick();

        match state.entries.get_mut(key) {
            Some(entry) => {
                state.recency.remove(&entry.last_access);
                entry.last_access = tick;
                state.recency.insert(tick, key.clone());
                state.hits += 1;
                Some(Arc::clone(&entry.result))
            }
            None => {
                state.misses += 1;
                None
            }
        }
    }

    /// Stores a result, evicting least recently used entries to stay within
    /// budget. A result larger than the whole budget is not stored.
    pub fn put(&self, key: CacheKey, result: impl Into<Arc<ResultSet>>) {
        let result = result.into();
        let size_bytes = result.estimated_size_bytes() + key.size_bytes();

        let mut state = lock(&self.state);
        state.remove(&key);

        if size_bytes > self.max_memory_bytes {
            debug!(
                size_bytes,
                max_memory_bytes = self.max_memory_bytes,
                "Result too large to cache"
            );
            return;
        }

        while state.memory_usage + size_bytes > self.max_memory_bytes {
            if !state.evict_oldest() {
                break;
            }
        }

        let tick = state.tick();
        state.recency.insert(tick, key.clone());
        state.memory_usage += size_bytes;
        state.entries.insert(
            key,
            CacheEntry {
                result,
                size_bytes,
                last_access: tick,
            },
        );
    }

    pub fn remove(&self, key: &CacheKey) -> bool {
        lock(&self.state).remove(key).is_some()
    }

    /// Drops every entry belonging to `connection_id`; returns how many went
    pub fn invalidate_connection(&self, connection_id: &str) -> usize {
        let mut state = lock(&self.state);
        let stale: Vec<CacheKey> = state
            .entries
            .keys()
            .filter(|k| k.connection_id == connection_id)
            .cloned()
            .collect();
        for key in &stale {
            state.remove(key);
        }
        if !stale.is_empty() {
            debug!(connection_id, removed = stale.len(), "Invalidated cached results");
        }
        stale.len()
    }

    /// Drops all entries; hit/miss counters are kept
    pub fn clear(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.recency.clear();
        state.memory_usage = 0;
    }

    pub fn stats(&self) -> CacheStats {
        let state = lock(&self.state);
        CacheStats {
            hit_count: state.hits,
            miss_count: state.misses,
            eviction_count: state.evictions,
            entry_count: state.entries.len(),
            memory_usage_bytes: state.memory_usage,
            max_memory_bytes: self.max_memory_bytes,
        }
    }
}
