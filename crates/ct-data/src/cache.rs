use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;

use crate::dataset::DatasetSplits;

/// Cached splits with access metadata
#[derive(Debug, Clone)]
struct CacheEntry {
    splits: DatasetSplits,
    last_accessed: DateTime<Utc>,
}

impl CacheEntry {
    fn new(splits: DatasetSplits) -> Self {
        Self {
            splits,
            last_accessed: Utc::now(),
        }
    }

    fn access(&mut self) {
        self.last_accessed = Utc::now();
    }
}

/// In-memory cache of prepared dataset splits, shared by all trial actors so
/// trials with identical dataset keys load the files once.
#[derive(Debug)]
pub struct DatasetCache {
    cache: DashMap<String, RwLock<CacheEntry>>,
    max_entries: usize,
    stats: RwLock<CacheStats>,
}

impl DatasetCache {
    pub fn new() -> Self {
        Self::with_limit(8)
    }

    pub fn with_limit(max_entries: usize) -> Self {
        Self {
            cache: DashMap::new(),
            max_entries: max_entries.max(1),
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<DatasetSplits> {
        if let Some(entry_lock) = self.cache.get(key) {
            let mut entry = entry_lock.write();
            entry.access();
            self.stats.write().hits += 1;
            return Some(entry.splits.clone());
        }

        self.stats.write().misses += 1;
        None
    }

    pub fn store(&self, key: &str, splits: &DatasetSplits) {
        if !self.cache.contains_key(key) && self.cache.len() >= self.max_entries {
            self.evict_lru();
        }
        self.cache
            .insert(key.to_string(), RwLock::new(CacheEntry::new(splits.clone())));
        self.stats.write().stores += 1;
    }

    /// Evict the least recently used entry
    fn evict_lru(&self) {
        let oldest = self
            .cache
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().read().last_accessed))
            .min_by_key(|(_, accessed)| *accessed)
            .map(|(key, _)| key);

        if let Some(key) = oldest {
            if self.cache.remove(&key).is_some() {
                tracing::debug!("Evicted cached dataset {}", key);
                self.stats.write().evictions += 1;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn clear(&self) {
        self.cache.clear();
        *self.stats.write() = CacheStats::default();
    }

    pub fn get_stats(&self) -> CacheStats {
        self.stats.read().clone()
    }
}

impl Default for DatasetCache {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub stores: u64,
    pub evictions: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        if self.hits + self.misses == 0 {
            0.0
        } else {
            self.hits as f64 / (self.hits + self.misses) as f64
        }
    }
}
