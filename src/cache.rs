//! Segment cache: an LRU-style, byte-budgeted cache of parsed
//! [`Segment`]s, plus small decoding caches for hot string and template
//! records.

use crate::config::CacheSize;
use crate::id::SegmentId;
use crate::segment::Segment;
use parking_lot::Mutex;
use quick_cache::sync::Cache;

/// Heuristic average segment size used to translate a byte budget into the
/// item-count capacity `quick_cache` wants; compaction and real workloads
/// rarely fill every segment to [`crate::segment::MAX_SEGMENT_SIZE`], so a
/// smaller average keeps the cache from under-admitting entries.
const ASSUMED_AVG_SEGMENT_BYTES: u64 = 32 * 1024;

const MIN_ITEM_CAPACITY: usize = 64;

/// Bounded cache of in-memory [`Segment`]s, keyed by segment id.
///
/// Disabled (via [`CacheSize::Off`]) reads always miss; the store then
/// always re-reads from the archive reader, which is the behavior the
/// store's correctness never depends on caching for.
pub struct SegmentCache {
    cache: Option<Cache<SegmentId, Segment>>,
    /// Shadow generation index, kept alongside the cache so that
    /// generation-based eviction doesn't depend on being able to iterate
    /// `quick_cache`'s concurrent cache directly.
    generations: Mutex<rustc_hash::FxHashMap<SegmentId, u32>>,
}

impl SegmentCache {
    #[must_use]
    pub fn new(size: CacheSize) -> Self {
        match size {
            CacheSize::Off => Self {
                cache: None,
                generations: Mutex::new(Default::default()),
            },
            CacheSize::Bytes(budget) => {
                let items = ((budget / ASSUMED_AVG_SEGMENT_BYTES) as usize).max(MIN_ITEM_CAPACITY);
                Self {
                    cache: Some(Cache::new(items)),
                    generations: Mutex::new(Default::default()),
                }
            }
        }
    }

    #[must_use]
    pub fn get(&self, id: &SegmentId) -> Option<Segment> {
        self.cache.as_ref().and_then(|c| c.get(id))
    }

    pub fn insert(&self, id: SegmentId, segment: Segment) {
        if let Some(cache) = &self.cache {
            self.generations.lock().insert(id, segment.generation());
            cache.insert(id, segment);
        }
    }

    pub fn remove(&self, id: &SegmentId) {
        if let Some(cache) = &self.cache {
            cache.remove(id);
        }
        self.generations.lock().remove(id);
    }

    /// Drops every cached entry whose generation is below `min_generation`.
    /// Called after a successful compaction, which eagerly evicts the
    /// superseded generation rather than waiting for LRU pressure.
    pub fn evict_generations_below(&self, min_generation: u32) {
        let Some(cache) = &self.cache else { return };
        let mut generations = self.generations.lock();
        let stale: Vec<SegmentId> = generations
            .iter()
            .filter(|(_, gen)| **gen < min_generation)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            cache.remove(id);
            generations.remove(id);
        }
    }

    #[must_use]
    pub fn is_enabled(&self) -> bool {
        self.cache.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::id::{SegmentKind, Version};
    use crate::segment::Builder;
    use test_log::test;

    fn sample_segment(generation: u32) -> (SegmentId, Segment) {
        let id = SegmentId::new_random(SegmentKind::Data, Version::CURRENT);
        let builder = Builder::new(generation);
        let (bytes, _) = builder.seal(id).unwrap();
        (id, Segment::parse(id, bytes.into()).unwrap())
    }

    #[test]
    fn disabled_cache_always_misses() {
        let cache = SegmentCache::new(CacheSize::Off);
        let (id, segment) = sample_segment(0);
        cache.insert(id, segment);
        assert!(cache.get(&id).is_none());
        assert!(!cache.is_enabled());
    }

    #[test]
    fn enabled_cache_hits_after_insert() {
        let cache = SegmentCache::new(CacheSize::Bytes(1024 * 1024));
        let (id, segment) = sample_segment(0);
        cache.insert(id, segment);
        assert!(cache.get(&id).is_some());
    }

    #[test]
    fn evicts_stale_generations() {
        let cache = SegmentCache::new(CacheSize::Bytes(1024 * 1024));
        let (old_id, old_segment) = sample_segment(1);
        let (new_id, new_segment) = sample_segment(5);
        cache.insert(old_id, old_segment);
        cache.insert(new_id, new_segment);

        cache.evict_generations_below(3);

        assert!(cache.get(&old_id).is_none());
        assert!(cache.get(&new_id).is_some());
    }
}
