//! Grain and sector caches.
//!
//! Both caches share one policy: a fixed maximum number of entries, and when
//! an insert would exceed it the whole cache is emptied first. There is no
//! recency tracking, which keeps lookups to a single hash lookup.

use std::{collections::HashMap, hash::Hash};

use log::trace;

/// Counters describing how a cache has been used.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Number of times the cache was emptied to make room
    pub clears: u64,
}

/// A map holding at most `max_entries` values, cleared as a whole on overflow.
#[derive(Debug)]
pub struct BoundedCache<K> {
    entries: HashMap<K, Vec<u8>>,
    max_entries: usize,
    stats: CacheStats,
}

impl<K: Hash + Eq> BoundedCache<K> {
    /// Creates an empty cache. A zero bound is raised to one entry.
    pub fn new(max_entries: usize) -> Self {
        BoundedCache {
            entries: HashMap::new(),
            max_entries: max_entries.max(1),
            stats: CacheStats::default(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<&[u8]> {
        match self.entries.get(key) {
            Some(value) => {
                self.stats.hits += 1;
                Some(value.as_slice())
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Inserts `value`, emptying the cache first if it is full.
    pub fn put(&mut self, key: K, value: Vec<u8>) {
        if self.entries.len() >= self.max_entries {
            trace!("Cache full ({} entries), clearing", self.entries.len());
            self.entries.clear();
            self.stats.clears += 1;
        }
        self.entries.insert(key, value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

/// Identifies a grain: the extent holding it and its sector in that extent's file.
///
/// Images split over several sparse extents reuse the same grain offsets in
/// every file, so the offset alone is not unique.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GrainKey {
    pub extent: usize,
    pub offset: u32,
}

/// Cache of decoded grains, sized from a byte budget.
pub type GrainCache = BoundedCache<GrainKey>;

/// Cache of 512-byte sectors keyed by absolute logical sector.
pub type SectorCache = BoundedCache<u64>;

impl GrainCache {
    /// Creates a grain cache holding as many grains of `grain_bytes` as fit in `budget_bytes`.
    pub fn with_budget(budget_bytes: usize, grain_bytes: usize) -> Self {
        let max_grains = if grain_bytes == 0 {
            1
        } else {
            budget_bytes / grain_bytes
        };
        BoundedCache::new(max_grains)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_and_miss_are_counted() {
        let mut cache: SectorCache = BoundedCache::new(4);
        assert!(cache.get(&1).is_none());
        cache.put(1, vec![7u8; 512]);
        assert_eq!(cache.get(&1), Some(&[7u8; 512][..]));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                clears: 0
            }
        );
    }

    #[test]
    fn test_overflow_clears_everything() {
        let mut cache: SectorCache = BoundedCache::new(3);
        for sector in 0..3 {
            cache.put(sector, vec![sector as u8; 512]);
        }
        assert_eq!(cache.len(), 3);

        cache.put(3, vec![3u8; 512]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.stats().clears, 1);
        for sector in 0..3 {
            assert!(cache.get(&sector).is_none());
        }
        assert!(cache.get(&3).is_some());
    }

    #[test]
    fn test_full_cache_clears_even_when_replacing_a_key() {
        let mut cache: SectorCache = BoundedCache::new(2);
        cache.put(0, vec![0u8; 512]);
        cache.put(1, vec![1u8; 512]);
        cache.put(1, vec![9u8; 512]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&1).map(|v| v[0]), Some(9));
        assert!(cache.get(&0).is_none());
        assert_eq!(cache.stats().clears, 1);
    }

    #[test]
    fn test_grain_budget() {
        let cache = GrainCache::with_budget(16 * 1024 * 1024, 128 * 512);
        assert_eq!(cache.capacity(), 256);
        // A grain larger than the budget still gets one slot.
        let cache = GrainCache::with_budget(1024, 64 * 1024);
        assert_eq!(cache.capacity(), 1);
    }

    #[test]
    fn test_grain_cache_never_exceeds_bound() {
        let mut cache = GrainCache::with_budget(4 * 4096, 4096);
        for offset in 2..50u32 {
            cache.put(GrainKey { extent: 0, offset }, vec![0u8; 4096]);
            assert!(cache.len() <= cache.capacity());
        }
        assert!(cache.get(&GrainKey { extent: 0, offset: 2 }).is_none());
        assert!(cache
            .get(&GrainKey { extent: 1, offset: 49 })
            .is_none());
        assert!(cache.get(&GrainKey { extent: 0, offset: 49 }).is_some());
    }
}
