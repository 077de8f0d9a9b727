//! Content-addressable pool of reusable block views.
//!
//! Views are parked under the [`ContentKey`] they were rendered for. A later render pass that needs
//! the same content gets the exact instance back and can skip construction and layout entirely.
//! While streaming, views are instead parked in a per-type slot and handed out for *any* content
//! of that type, trading exactness for continuity.

use std::any::TypeId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use lru::LruCache;
use metrics::counter;
use tracing::debug;

use super::clock::{Clock, SystemClock};
use super::config::PoolConfig;
use super::keys::ContentKey;
use super::lock::mutex_lock;
use super::view::{PooledView, short_type_name};

const SOURCE: &str = "cache::pool";

const METRIC_POOL_HIT: &str = "mdcache_pool_hit_total";
const METRIC_POOL_FALLBACK: &str = "mdcache_pool_fallback_total";
const METRIC_POOL_MISS: &str = "mdcache_pool_miss_total";
const METRIC_POOL_EVICT: &str = "mdcache_pool_evict_total";

struct PoolEntry {
    view: Box<dyn PooledView>,
    type_id: TypeId,
    inserted_at: Instant,
}

/// Counters describing pool effectiveness since creation or the last [`AttachmentPool::clear`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub exact_hits: u64,
    pub fallback_hits: u64,
    pub misses: u64,
    pub type_mismatches: u64,
    pub recycled: u64,
    pub evicted_expired: u64,
    pub evicted_capacity: u64,
    pub evicted_pressure: u64,
}

impl PoolStats {
    /// Percentage of dequeues served from the pool, exact or fallback.
    pub fn hit_rate(&self) -> f64 {
        let hits = self.exact_hits + self.fallback_hits;
        let total = hits + self.misses;
        if total == 0 {
            0.0
        } else {
            hits as f64 / total as f64 * 100.0
        }
    }
}

struct PoolState {
    // Recency order doubles as the LRU access list: most recently touched key first.
    entries: LruCache<ContentKey, Vec<PoolEntry>>,
    streaming: HashMap<TypeId, Box<dyn PooledView>>,
    pooled: usize,
    stats: PoolStats,
}

impl PoolState {
    fn new() -> Self {
        Self {
            entries: LruCache::unbounded(),
            streaming: HashMap::new(),
            pooled: 0,
            stats: PoolStats::default(),
        }
    }
}

/// Recycles block views keyed by the content they display.
///
/// One mutex serializes every operation, so a `recycle` racing a `dequeue` on the same key
/// resolves to one of the two orders, never a torn state. Ownership of a view moves to the caller
/// on dequeue; the pool can only evict views it currently holds.
pub struct AttachmentPool {
    state: Mutex<PoolState>,
    capacity: usize,
    ttl: Duration,
    clock: Arc<dyn Clock>,
}

impl AttachmentPool {
    pub fn new(config: &PoolConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock))
    }

    pub fn with_clock(config: &PoolConfig, clock: Arc<dyn Clock>) -> Self {
        let capacity = config.effective_capacity();
        debug!(
            op = "pool::new",
            capacity,
            ttl_ms = config.ttl.as_millis() as u64,
            "Attachment pool created"
        );
        Self {
            state: Mutex::new(PoolState::new()),
            capacity,
            ttl: config.ttl,
            clock,
        }
    }

    /// Take a pooled view of type `T` for `key`.
    ///
    /// Returns the view and whether it was an exact content match. Entries under `key` whose type
    /// is not `T` are discarded as they are encountered. When nothing matches and
    /// `allow_streaming_fallback` is set, the streaming slot for `T` is tried.
    pub fn dequeue<T: PooledView>(
        &self,
        key: &ContentKey,
        allow_streaming_fallback: bool,
    ) -> Option<(Box<T>, bool)> {
        let wanted = TypeId::of::<T>();
        let mut guard = mutex_lock(&self.state, SOURCE, "dequeue");
        let state = &mut *guard;

        let mut discarded = 0_u64;
        let mut found = None;
        if let Some(list) = state.entries.get_mut(key) {
            while let Some(entry) = list.pop() {
                state.pooled = state.pooled.saturating_sub(1);
                if entry.type_id != wanted {
                    discarded += 1;
                    continue;
                }
                if let Ok(view) = entry.view.into_any().downcast::<T>() {
                    found = Some(view);
                    break;
                }
                discarded += 1;
            }
            if list.is_empty() {
                state.entries.pop(key);
            }
        }

        if discarded > 0 {
            state.stats.type_mismatches += discarded;
            debug!(
                op = "pool::dequeue",
                result = "type_mismatch",
                key_kind = key.kind(),
                view_type = short_type_name::<T>(),
                discarded,
                "Discarded pooled views of a different type"
            );
        }

        if let Some(view) = found {
            state.stats.exact_hits += 1;
            counter!(METRIC_POOL_HIT, "kind" => key.kind()).increment(1);
            debug!(
                op = "pool::dequeue",
                result = "exact_hit",
                key_kind = key.kind(),
                view_type = short_type_name::<T>(),
                "Reused pooled view"
            );
            return Some((view, true));
        }

        if allow_streaming_fallback {
            if let Some(view) = state.streaming.remove(&wanted) {
                if let Ok(view) = view.into_any().downcast::<T>() {
                    state.stats.fallback_hits += 1;
                    counter!(METRIC_POOL_FALLBACK, "kind" => key.kind()).increment(1);
                    debug!(
                        op = "pool::dequeue",
                        result = "fallback_hit",
                        key_kind = key.kind(),
                        view_type = short_type_name::<T>(),
                        "Reused streaming view for different content"
                    );
                    return Some((view, false));
                }
            }
        }

        state.stats.misses += 1;
        counter!(METRIC_POOL_MISS, "kind" => key.kind()).increment(1);
        None
    }

    /// Hand a view back to the pool.
    ///
    /// Streaming-eligible views are reset and parked in the single slot for their type, replacing
    /// any previous occupant. Others are appended under `key` and trigger an eviction pass.
    pub fn recycle(&self, mut view: Box<dyn PooledView>, key: ContentKey, streaming_eligible: bool) {
        view.detach();
        let type_id = view.view_type();

        if streaming_eligible {
            view.prepare_for_reuse();
            let mut state = mutex_lock(&self.state, SOURCE, "recycle.streaming");
            let replaced = state.streaming.insert(type_id, view).is_some();
            state.stats.recycled += 1;
            debug!(
                op = "pool::recycle",
                mode = "streaming",
                key_kind = key.kind(),
                replaced,
                "Parked view in streaming slot"
            );
            return;
        }

        let now = self.clock.now();
        let mut guard = mutex_lock(&self.state, SOURCE, "recycle");
        let state = &mut *guard;
        state
            .entries
            .get_or_insert_mut(key, Vec::new)
            .push(PoolEntry {
                view,
                type_id,
                inserted_at: now,
            });
        state.pooled += 1;
        state.stats.recycled += 1;

        self.evict_locked(state, now);
    }

    /// Drop expired entries, then shrink to capacity by evicting least-recently-touched keys.
    pub fn evict_if_needed(&self) {
        let now = self.clock.now();
        let mut guard = mutex_lock(&self.state, SOURCE, "evict_if_needed");
        self.evict_locked(&mut guard, now);
    }

    fn evict_locked(&self, state: &mut PoolState, now: Instant) {
        let ttl = self.ttl;
        let mut expired = 0_usize;
        for (_, list) in state.entries.iter_mut() {
            let before = list.len();
            list.retain(|entry| now.saturating_duration_since(entry.inserted_at) < ttl);
            expired += before - list.len();
        }

        if expired > 0 {
            let empty: Vec<ContentKey> = state
                .entries
                .iter()
                .filter(|(_, list)| list.is_empty())
                .map(|(key, _)| key.clone())
                .collect();
            for key in &empty {
                state.entries.pop(key);
            }
            state.pooled = state.pooled.saturating_sub(expired);
            state.stats.evicted_expired += expired as u64;
            counter!(METRIC_POOL_EVICT, "reason" => "expired").increment(expired as u64);
            debug!(
                op = "pool::evict",
                reason = "expired",
                evicted = expired,
                keys_removed = empty.len(),
                remaining = state.pooled,
                "Dropped expired pooled views"
            );
        }

        let mut over_capacity = 0_usize;
        while state.pooled > self.capacity {
            let Some((key, list)) = state.entries.pop_lru() else {
                break;
            };
            state.pooled = state.pooled.saturating_sub(list.len());
            over_capacity += list.len();
            debug!(
                op = "pool::evict",
                reason = "capacity",
                key_kind = key.kind(),
                evicted = list.len(),
                "Evicted least recently used key"
            );
        }

        if over_capacity > 0 {
            state.stats.evicted_capacity += over_capacity as u64;
            counter!(METRIC_POOL_EVICT, "reason" => "capacity").increment(over_capacity as u64);
        }
    }

    /// React to a memory warning: drop the older half of keyed views and every streaming slot.
    ///
    /// Exactly `ceil(pooled / 2)` keyed views go, least recently touched keys first. The last key
    /// reached may be trimmed partially: its oldest views are dropped and the key keeps its
    /// position with the newest ones.
    pub fn on_memory_pressure(&self) {
        let mut guard = mutex_lock(&self.state, SOURCE, "on_memory_pressure");
        let state = &mut *guard;

        let target = state.pooled.div_ceil(2);
        let mut removed = 0_usize;
        while removed < target {
            let needed = target - removed;
            let Some((key, len)) = state
                .entries
                .peek_lru()
                .map(|(key, list)| (key.clone(), list.len()))
            else {
                break;
            };
            if len > needed {
                if let Some(list) = state.entries.peek_mut(&key) {
                    list.drain(..needed);
                }
                removed += needed;
                break;
            }
            state.entries.pop_lru();
            removed += len;
        }
        state.pooled = state.pooled.saturating_sub(removed);

        let slots = state.streaming.len();
        state.streaming.clear();

        state.stats.evicted_pressure += (removed + slots) as u64;
        counter!(METRIC_POOL_EVICT, "reason" => "memory_pressure")
            .increment((removed + slots) as u64);
        debug!(
            op = "pool::on_memory_pressure",
            evicted = removed,
            streaming_slots = slots,
            remaining = state.pooled,
            "Trimmed pool after memory warning"
        );
    }

    /// Drop every pooled view, streaming slot and counter.
    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        *state = PoolState::new();
    }

    /// Number of views parked under content keys.
    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").pooled
    }

    /// Check if no views are parked under content keys.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of occupied streaming slots.
    pub fn streaming_len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "streaming_len")
            .streaming
            .len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn stats(&self) -> PoolStats {
        mutex_lock(&self.state, SOURCE, "stats").stats
    }

    pub fn log_stats(&self, context: &str) {
        let state = mutex_lock(&self.state, SOURCE, "log_stats");
        let stats = state.stats;
        debug!(
            op = "pool::stats",
            context,
            pooled = state.pooled,
            capacity = self.capacity,
            keys = state.entries.len(),
            streaming_slots = state.streaming.len(),
            exact_hits = stats.exact_hits,
            fallback_hits = stats.fallback_hits,
            misses = stats.misses,
            hit_rate = %format!("{:.1}%", stats.hit_rate()),
            evicted_expired = stats.evicted_expired,
            evicted_capacity = stats.evicted_capacity,
            "Attachment pool stats"
        );
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::cache::clock::ManualClock;

    #[derive(Debug)]
    struct CodeView {
        id: u32,
        resets: usize,
        detached: bool,
    }

    impl CodeView {
        fn boxed(id: u32) -> Box<Self> {
            Box::new(Self {
                id,
                resets: 0,
                detached: false,
            })
        }
    }

    impl PooledView for CodeView {
        fn prepare_for_reuse(&mut self) {
            self.resets += 1;
        }

        fn detach(&mut self) {
            self.detached = true;
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    #[derive(Debug)]
    struct RuleView;

    impl PooledView for RuleView {
        fn prepare_for_reuse(&mut self) {}

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    static DROPS: AtomicUsize = AtomicUsize::new(0);

    struct CountedView;

    impl Drop for CountedView {
        fn drop(&mut self) {
            DROPS.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl PooledView for CountedView {
        fn prepare_for_reuse(&mut self) {}

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    fn key(n: u32) -> ContentKey {
        ContentKey::code_block(&format!("let x = {n};"), Some("rust"), true, 320.0, false)
    }

    fn pool_with(capacity: usize, clock: Arc<ManualClock>) -> AttachmentPool {
        let config = PoolConfig {
            capacity: Some(capacity),
            ttl: Duration::from_secs(30),
        };
        AttachmentPool::with_clock(&config, clock)
    }

    fn pool(capacity: usize) -> AttachmentPool {
        pool_with(capacity, Arc::new(ManualClock::new()))
    }

    #[test]
    fn dequeue_on_empty_pool_misses() {
        let pool = pool(10);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert!(pool.dequeue::<CodeView>(&key(1), true).is_none());
        assert_eq!(pool.stats().misses, 2);
    }

    #[test]
    fn recycle_then_dequeue_returns_same_view_exactly() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(7), key(1), false);

        let (view, exact) = pool.dequeue::<CodeView>(&key(1), false).expect("pooled view");
        assert!(exact);
        assert_eq!(view.id, 7);
        assert!(view.detached);
        assert_eq!(view.resets, 0);
        assert!(pool.is_empty());
    }

    #[test]
    fn dequeue_is_last_in_first_out_per_key() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(1), key(9), false);
        pool.recycle(CodeView::boxed(2), key(9), false);

        let (b, _) = pool.dequeue::<CodeView>(&key(9), false).expect("second view");
        assert_eq!(b.id, 2);
        let (a, _) = pool.dequeue::<CodeView>(&key(9), false).expect("first view");
        assert_eq!(a.id, 1);
        assert!(pool.dequeue::<CodeView>(&key(9), false).is_none());
    }

    #[test]
    fn type_mismatch_is_a_silent_miss_that_discards_the_entry() {
        let pool = pool(10);
        pool.recycle(Box::new(RuleView), key(1), false);

        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert!(pool.dequeue::<RuleView>(&key(1), false).is_none());

        let stats = pool.stats();
        assert_eq!(stats.type_mismatches, 1);
        assert_eq!(pool.len(), 0);
    }

    #[test]
    fn mismatched_entries_are_skipped_to_reach_a_matching_one() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(3), key(1), false);
        pool.recycle(Box::new(RuleView), key(1), false);

        let (view, exact) = pool.dequeue::<CodeView>(&key(1), false).expect("code view");
        assert!(exact);
        assert_eq!(view.id, 3);
        assert_eq!(pool.stats().type_mismatches, 1);
    }

    #[test]
    fn streaming_recycle_resets_and_serves_any_key_of_same_type() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(5), key(1), true);
        assert_eq!(pool.streaming_len(), 1);
        assert!(pool.is_empty());

        assert!(pool.dequeue::<CodeView>(&key(2), false).is_none());

        let (view, exact) = pool.dequeue::<CodeView>(&key(2), true).expect("fallback view");
        assert!(!exact);
        assert_eq!(view.id, 5);
        assert_eq!(view.resets, 1);
        assert_eq!(pool.streaming_len(), 0);
    }

    #[test]
    fn streaming_slot_holds_one_view_per_type() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(1), key(1), true);
        pool.recycle(CodeView::boxed(2), key(2), true);
        pool.recycle(Box::new(RuleView), ContentKey::rule(100.0, false), true);
        assert_eq!(pool.streaming_len(), 2);

        let (view, _) = pool.dequeue::<CodeView>(&key(3), true).expect("fallback");
        assert_eq!(view.id, 2);
        assert!(pool.dequeue::<CodeView>(&key(3), true).is_none());
    }

    #[test]
    fn exact_match_preferred_over_streaming_slot() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(1), key(1), true);
        pool.recycle(CodeView::boxed(2), key(2), false);

        let (view, exact) = pool.dequeue::<CodeView>(&key(2), true).expect("exact");
        assert!(exact);
        assert_eq!(view.id, 2);
        assert_eq!(pool.streaming_len(), 1);
    }

    #[test]
    fn capacity_eviction_removes_least_recently_touched_keys() {
        let pool = pool(3);
        for n in 0..4 {
            pool.recycle(CodeView::boxed(n), key(n), false);
        }

        assert_eq!(pool.len(), 3);
        assert!(pool.dequeue::<CodeView>(&key(0), false).is_none());
        for n in 1..4 {
            assert!(pool.dequeue::<CodeView>(&key(n), false).is_some());
        }
        assert_eq!(pool.stats().evicted_capacity, 1);
    }

    #[test]
    fn capacity_eviction_drops_whole_key() {
        let pool = pool(3);
        pool.recycle(CodeView::boxed(1), key(1), false);
        pool.recycle(CodeView::boxed(2), key(1), false);
        pool.recycle(CodeView::boxed(3), key(2), false);
        pool.recycle(CodeView::boxed(4), key(3), false);

        assert_eq!(pool.len(), 2);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
    }

    #[test]
    fn recycling_refreshes_key_recency() {
        let pool = pool(3);
        pool.recycle(CodeView::boxed(1), key(1), false);
        pool.recycle(CodeView::boxed(2), key(2), false);
        pool.recycle(CodeView::boxed(3), key(3), false);
        // Touch key 1 again so key 2 becomes the eviction candidate.
        let (view, _) = pool.dequeue::<CodeView>(&key(1), false).expect("view");
        pool.recycle(view, key(1), false);
        pool.recycle(CodeView::boxed(4), key(4), false);

        assert!(pool.dequeue::<CodeView>(&key(2), false).is_none());
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_some());
    }

    #[test]
    fn expired_views_are_dropped_even_under_capacity() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(50, clock.clone());
        pool.recycle(CodeView::boxed(1), key(1), false);

        clock.advance(Duration::from_secs(29));
        pool.evict_if_needed();
        assert_eq!(pool.len(), 1);

        clock.advance(Duration::from_secs(1));
        pool.evict_if_needed();
        assert_eq!(pool.len(), 0);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert_eq!(pool.stats().evicted_expired, 1);
    }

    #[test]
    fn expiry_keeps_fresh_entries_under_the_same_key() {
        let clock = Arc::new(ManualClock::new());
        let pool = pool_with(50, clock.clone());
        pool.recycle(CodeView::boxed(1), key(1), false);
        clock.advance(Duration::from_secs(20));
        pool.recycle(CodeView::boxed(2), key(1), false);
        clock.advance(Duration::from_secs(15));
        pool.evict_if_needed();

        let (view, _) = pool.dequeue::<CodeView>(&key(1), false).expect("fresh view");
        assert_eq!(view.id, 2);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
    }

    #[test]
    fn memory_pressure_halves_keyed_views_and_clears_streaming() {
        let pool = pool(50);
        for n in 0..4 {
            pool.recycle(CodeView::boxed(n), key(n), false);
        }
        pool.recycle(Box::new(RuleView), ContentKey::rule(10.0, false), true);

        pool.on_memory_pressure();

        assert_eq!(pool.len(), 2);
        assert_eq!(pool.streaming_len(), 0);
        assert!(pool.dequeue::<CodeView>(&key(0), false).is_none());
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert!(pool.dequeue::<CodeView>(&key(3), false).is_some());
    }

    #[test]
    fn memory_pressure_trims_a_crowded_key_partially() {
        let pool = pool(50);
        pool.recycle(CodeView::boxed(0), key(0), false);
        for n in 0..10 {
            pool.recycle(CodeView::boxed(100 + n), key(1), false);
        }
        for n in 2..11 {
            pool.recycle(CodeView::boxed(n), key(n), false);
        }
        assert_eq!(pool.len(), 20);

        pool.on_memory_pressure();

        assert_eq!(pool.len(), 10);
        assert_eq!(pool.stats().evicted_pressure, 10);
        assert!(pool.dequeue::<CodeView>(&key(0), false).is_none());
        let (survivor, _) = pool.dequeue::<CodeView>(&key(1), false).expect("newest view kept");
        assert_eq!(survivor.id, 109);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert!(pool.dequeue::<CodeView>(&key(10), false).is_some());
    }

    #[test]
    fn memory_pressure_on_single_view_frees_it() {
        let pool = pool(50);
        pool.recycle(CodeView::boxed(1), key(1), false);
        pool.on_memory_pressure();
        assert!(pool.is_empty());
    }

    #[test]
    fn clear_drops_everything_and_resets_counters() {
        let pool = pool(10);
        pool.recycle(CodeView::boxed(1), key(1), false);
        pool.recycle(CodeView::boxed(2), key(2), true);
        let _ = pool.dequeue::<CodeView>(&key(9), false);

        pool.clear();

        assert!(pool.dequeue::<CodeView>(&key(1), false).is_none());
        assert_eq!(pool.streaming_len(), 0);
        let stats = pool.stats();
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.recycled, 0);
    }

    #[test]
    fn evicted_views_are_dropped() {
        DROPS.store(0, Ordering::SeqCst);
        let pool = pool(1);
        pool.recycle(Box::new(CountedView), key(1), false);
        pool.recycle(Box::new(CountedView), key(2), false);
        assert_eq!(DROPS.load(Ordering::SeqCst), 1);
        pool.clear();
        assert_eq!(DROPS.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn hit_rate_counts_exact_and_fallback() {
        let stats = PoolStats {
            exact_hits: 2,
            fallback_hits: 1,
            misses: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 75.0).abs() < f64::EPSILON);
        assert_eq!(PoolStats::default().hit_rate(), 0.0);
    }

    #[test]
    fn pool_recovers_from_poisoned_lock() {
        let pool = pool(10);

        let _ = catch_unwind(AssertUnwindSafe(|| {
            let _guard = pool.state.lock().expect("pool lock should be acquired");
            panic!("poison pool lock");
        }));

        pool.recycle(CodeView::boxed(1), key(1), false);
        assert!(pool.dequeue::<CodeView>(&key(1), false).is_some());
    }
}
