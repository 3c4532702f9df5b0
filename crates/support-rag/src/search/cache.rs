use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::CacheConfig;

struct CacheEntry<V> {
    value: Arc<V>,
    inserted_at: Instant,
}

#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub expired: u64,
    pub sets: u64,
    pub size: usize,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Lowercase, collapse whitespace, drop punctuation.
pub fn normalize_query(query: &str) -> String {
    query
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace() || *c == '_')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Short-lived query cache shared across requests.
///
/// Values are stored behind `Arc` and replaced whole, so a reader sees either
/// the old entry or the new one. Concurrent writers to the same key race and
/// the last one wins.
pub struct ResultCache<V> {
    entries: DashMap<String, Arc<CacheEntry<V>>>,
    ttl: Duration,
    cleanup_threshold: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    expired: AtomicU64,
    sets: AtomicU64,
}

impl<V> ResultCache<V> {
    pub fn new(ttl: Duration, cleanup_threshold: usize) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
            cleanup_threshold,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            expired: AtomicU64::new(0),
            sets: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &CacheConfig) -> Self {
        Self::new(Duration::from_secs(config.ttl_secs), config.cleanup_threshold)
    }

    fn key(query: &str, context: &str) -> String {
        format!("{}::{}", normalize_query(query), context)
    }

    pub fn get(&self, query: &str, context: &str) -> Option<Arc<V>> {
        let key = Self::key(query, context);
        let entry = self.entries.get(&key).map(|e| Arc::clone(e.value()));
        match entry {
            Some(entry) if entry.inserted_at.elapsed() < self.ttl => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Some(Arc::clone(&entry.value))
            }
            Some(_) => {
                self.entries.remove(&key);
                self.expired.fetch_add(1, Ordering::Relaxed);
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    pub fn insert(&self, query: &str, context: &str, value: V) -> Arc<V> {
        let value = Arc::new(value);
        let entry = Arc::new(CacheEntry {
            value: Arc::clone(&value),
            inserted_at: Instant::now(),
        });
        self.entries.insert(Self::key(query, context), entry);
        self.sets.fetch_add(1, Ordering::Relaxed);

        if self.entries.len() > self.cleanup_threshold {
            self.sweep();
        }
        value
    }

    /// Drop every expired entry.
    pub fn sweep(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.ttl;
        self.entries.retain(|_, entry| entry.inserted_at.elapsed() < ttl);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            self.expired.fetch_add(removed as u64, Ordering::Relaxed);
            tracing::debug!(removed, "Swept expired cache entries");
        }
        removed
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            sets: self.sets.load(Ordering::Relaxed),
            size: self.entries.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_query() {
        assert_eq!(normalize_query("  What's   the FEE?? "), "whats the fee");
        assert_eq!(normalize_query("card_declined!"), "card_declined");
    }

    #[test]
    fn test_equivalent_queries_share_entry() {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        cache.insert("How do refunds work?", "all", 42u32);
        assert_eq!(cache.get("how do refunds   work", "all").as_deref(), Some(&42));
        assert!(cache.get("how do refunds work", "category=billing;source=*").is_none());

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert!((stats.hit_rate() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_expired_entry_is_dropped() {
        let cache = ResultCache::new(Duration::from_millis(20), 100);
        cache.insert("refunds", "all", "cached".to_string());
        std::thread::sleep(Duration::from_millis(40));
        assert!(cache.get("refunds", "all").is_none());
        assert_eq!(cache.stats().expired, 1);
        assert_eq!(cache.stats().size, 0);
    }

    #[test]
    fn test_sweep_runs_past_threshold() {
        let cache = ResultCache::new(Duration::from_millis(10), 3);
        for i in 0..3 {
            cache.insert(&format!("q{i}"), "all", i);
        }
        std::thread::sleep(Duration::from_millis(30));
        cache.insert("fresh", "all", 99);
        cache.insert("fresh2", "all", 100);
        assert_eq!(cache.stats().size, 2);
    }

    #[test]
    fn test_readers_keep_old_value_after_replace() {
        let cache = ResultCache::new(Duration::from_secs(60), 100);
        cache.insert("q", "all", vec![1, 2, 3]);
        let held = cache.get("q", "all").unwrap();
        cache.insert("q", "all", vec![9]);
        assert_eq!(*held, vec![1, 2, 3]);
        assert_eq!(*cache.get("q", "all").unwrap(), vec![9]);
    }
}
