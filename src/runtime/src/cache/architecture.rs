//! Architecture cache.
//!
//! Architecture support of a tag changes far less often than its digest, so
//! lookups are kept for a bounded interval keyed by the full image reference.
//! The cache is owned by a resolver instance; nothing here is global.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Cached architecture list for one reference.
#[derive(Debug, Clone)]
struct CacheEntry {
    architectures: Vec<String>,
    stored_at: Instant,
}

impl CacheEntry {
    fn is_expired(&self, ttl: Duration) -> bool {
        self.stored_at.elapsed() >= ttl
    }
}

/// Concurrent TTL cache of architecture lists.
#[derive(Debug)]
pub struct ArchitectureCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ArchitectureCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Fresh entry for `key`, if any. Expired entries are evicted on read.
    pub fn get(&self, key: &str) -> Option<Vec<String>> {
        let expired = match self.entries.get(key) {
            Some(entry) if !entry.is_expired(self.ttl) => {
                return Some(entry.architectures.clone());
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            self.entries
                .remove_if(key, |_, entry| entry.is_expired(self.ttl));
            tracing::trace!(key, "Evicted expired architecture cache entry");
        }
        None
    }

    pub fn insert(&self, key: impl Into<String>, architectures: Vec<String>) {
        self.entries.insert(
            key.into(),
            CacheEntry {
                architectures,
                stored_at: Instant::now(),
            },
        );
    }

    /// Drop the entry for `key`. Returns true if one existed.
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Number of entries, expired ones included.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}
