//! Logical statement cache.
//!
//! sqlx already caches *compiled* statements per connection, keyed by SQL
//! text. What it cannot guarantee is that dynamically assembled queries
//! (claim filters, list filters) produce one stable SQL string per shape.
//! This cache pins the generated SQL under a logical key such as
//! `jobs:claim:tenant:min` so every query shape compiles exactly once per
//! connection, and exposes hit/miss counters for observability.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::{Result, StoreError};

/// Observable cache state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub size: usize,
    pub keys: Vec<String>,
}

#[derive(Default)]
pub struct StatementCache {
    entries: Mutex<HashMap<String, Arc<str>>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl StatementCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the SQL cached under `key`, building and inserting it on miss.
    ///
    /// Binding the same key to different SQL is a programming error. The
    /// check runs in debug builds, where `build` is re-derived on hits and
    /// compared against the cached text.
    pub fn sql<F>(&self, key: &str, build: F) -> Result<Arc<str>>
    where
        F: FnOnce() -> String,
    {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(cached) = entries.get(key) {
            #[cfg(debug_assertions)]
            {
                let fresh = build();
                if fresh != **cached {
                    return Err(StoreError::StatementCacheConflict {
                        key: key.to_string(),
                    });
                }
            }
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Arc::clone(cached));
        }

        let sql: Arc<str> = Arc::from(build());
        entries.insert(key.to_string(), Arc::clone(&sql));
        self.misses.fetch_add(1, Ordering::Relaxed);
        Ok(sql)
    }

    pub fn stats(&self) -> CacheStats {
        let entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let mut keys: Vec<String> = entries.keys().cloned().collect();
        keys.sort();
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            size: entries.len(),
            keys,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn caches_one_sql_per_key() {
        let cache = StatementCache::new();

        let a = cache.sql("jobs:list", || "SELECT 1".to_string()).unwrap();
        let b = cache.sql("jobs:list", || "SELECT 1".to_string()).unwrap();
        assert_eq!(a, b);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.size, 1);
        assert_eq!(stats.keys, vec!["jobs:list".to_string()]);
    }

    #[test]
    fn distinct_shapes_get_distinct_entries() {
        let cache = StatementCache::new();
        cache
            .sql("jobs:list:status", || "SELECT 1 WHERE status = ?".into())
            .unwrap();
        cache
            .sql("jobs:list:status:type", || {
                "SELECT 1 WHERE status = ? AND type = ?".into()
            })
            .unwrap();
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn same_key_different_sql_fails_loudly() {
        let cache = StatementCache::new();
        cache.sql("jobs:list", || "SELECT 1".to_string()).unwrap();

        let err = cache
            .sql("jobs:list", || "SELECT 2".to_string())
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::StatementCacheConflict { key } if key == "jobs:list"
        ));
    }
}
