//! In-memory tier of decoded bitmaps.

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use tracing::debug;

use super::decode::{DecodedImage, TargetSize};

pub(crate) type MemoryKey = (String, TargetSize);

/// Cost-bounded LRU of decoded images keyed by source and target size.
pub(crate) struct MemoryTierCache {
    entries: LruCache<MemoryKey, Arc<DecodedImage>>,
    total_cost: u64,
    budget_bytes: u64,
}

impl MemoryTierCache {
    pub(crate) fn new(budget_bytes: u64, count_limit: NonZeroUsize) -> Self {
        Self {
            entries: LruCache::new(count_limit),
            total_cost: 0,
            budget_bytes,
        }
    }

    pub(crate) fn get(&mut self, key: &MemoryKey) -> Option<Arc<DecodedImage>> {
        self.entries.get(key).cloned()
    }

    /// Insert an image, evicting least-recently-used entries to respect both bounds.
    ///
    /// Returns the number of entries evicted. Images costing more than the whole budget are not
    /// retained.
    pub(crate) fn insert(&mut self, key: MemoryKey, image: Arc<DecodedImage>) -> usize {
        let cost = image.cost();
        if cost > self.budget_bytes {
            debug!(
                op = "image::memory::insert",
                result = "over_budget",
                cost,
                budget = self.budget_bytes,
                "Decoded image larger than memory budget; not retained"
            );
            return 0;
        }

        let mut evicted = 0;
        let replacing = self.entries.contains(&key);
        if let Some((_, displaced)) = self.entries.push(key, image) {
            // Either the previous value for this key or the LRU entry dropped at the count limit.
            self.total_cost = self.total_cost.saturating_sub(displaced.cost());
            if !replacing {
                evicted += 1;
            }
        }
        self.total_cost += cost;
        evicted + self.shrink_to(self.budget_bytes)
    }

    fn shrink_to(&mut self, budget: u64) -> usize {
        let mut evicted = 0;
        while self.total_cost > budget {
            let Some((_, image)) = self.entries.pop_lru() else {
                self.total_cost = 0;
                break;
            };
            self.total_cost = self.total_cost.saturating_sub(image.cost());
            evicted += 1;
        }
        evicted
    }

    pub(crate) fn set_limits(&mut self, budget_bytes: u64, count_limit: NonZeroUsize) {
        self.budget_bytes = budget_bytes;
        while self.entries.len() > count_limit.get() {
            match self.entries.pop_lru() {
                Some((_, image)) => {
                    self.total_cost = self.total_cost.saturating_sub(image.cost());
                }
                None => break,
            }
        }
        self.entries.resize(count_limit);
        self.shrink_to(budget_bytes);
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
        self.total_cost = 0;
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn total_cost(&self) -> u64 {
        self.total_cost
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::image::decode::{decode_downsampled, encode_png};

    fn image(width: u32, height: u32) -> Arc<DecodedImage> {
        Arc::new(decode_downsampled(&encode_png(width, height), u32::MAX).expect("decode"))
    }

    fn key(name: &str) -> MemoryKey {
        (name.to_string(), TargetSize::new(10, 10))
    }

    fn limit(n: usize) -> NonZeroUsize {
        NonZeroUsize::new(n).expect("non-zero")
    }

    #[test]
    fn cost_budget_evicts_least_recent() {
        // Each 10x10 image costs 400 bytes.
        let mut cache = MemoryTierCache::new(1000, limit(10));
        cache.insert(key("a"), image(10, 10));
        cache.insert(key("b"), image(10, 10));
        assert!(cache.get(&key("a")).is_some());
        let evicted = cache.insert(key("c"), image(10, 10));

        assert_eq!(evicted, 1);
        assert_eq!(cache.total_cost(), 800);
        assert!(cache.get(&key("b")).is_none());
        assert!(cache.get(&key("a")).is_some());
    }

    #[test]
    fn count_limit_is_enforced() {
        let mut cache = MemoryTierCache::new(u64::MAX, limit(2));
        cache.insert(key("a"), image(1, 1));
        cache.insert(key("b"), image(1, 1));
        cache.insert(key("c"), image(1, 1));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_cost(), 8);
        assert!(cache.get(&key("a")).is_none());
    }

    #[test]
    fn replacing_a_key_keeps_cost_accurate() {
        let mut cache = MemoryTierCache::new(u64::MAX, limit(4));
        cache.insert(key("a"), image(10, 10));
        cache.insert(key("a"), image(1, 1));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.total_cost(), 4);
    }

    #[test]
    fn oversized_image_is_not_retained() {
        let mut cache = MemoryTierCache::new(100, limit(4));
        cache.insert(key("big"), image(10, 10));
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.total_cost(), 0);
    }

    #[test]
    fn shrinking_limits_evicts() {
        let mut cache = MemoryTierCache::new(u64::MAX, limit(4));
        for name in ["a", "b", "c", "d"] {
            cache.insert(key(name), image(10, 10));
        }
        cache.set_limits(800, limit(3));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.total_cost(), 800);
        assert!(cache.get(&key("d")).is_some());
    }
}
