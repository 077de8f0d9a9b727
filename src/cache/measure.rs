//! Memoized text measurements for table layout.
//!
//! Table layout measures every cell twice per pass: once unconstrained to find its preferred
//! size, and once at the final column width to find its height. Both results depend only on the
//! cell's content and the width, so they are cached here across re-renders.

use std::collections::HashMap;
use std::sync::Mutex;

use metrics::counter;
use tracing::debug;

use super::config::MeasureConfig;
use super::keys::round_width;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::measure";

const METRIC_MEASURE_HIT: &str = "mdcache_measure_hit_total";
const METRIC_MEASURE_MISS: &str = "mdcache_measure_miss_total";
const METRIC_MEASURE_EVICT: &str = "mdcache_measure_evict_total";

#[derive(Debug, Clone, Copy)]
struct IntrinsicEntry {
    width: f64,
    height: f64,
    seq: u64,
}

#[derive(Debug, Clone, Copy)]
struct ConstrainedEntry {
    height: f64,
    seq: u64,
}

/// Counters for the measurement cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MeasureStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl MeasureStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64 * 100.0
        }
    }
}

#[derive(Default)]
struct MeasureState {
    intrinsic: HashMap<u64, IntrinsicEntry>,
    constrained: HashMap<(u64, u32), ConstrainedEntry>,
    seq: u64,
    stats: MeasureStats,
}

impl MeasureState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    fn len(&self) -> usize {
        self.intrinsic.len() + self.constrained.len()
    }
}

enum Victim {
    Intrinsic(u64),
    Constrained((u64, u32)),
}

/// Caches cell measurements keyed by content hash.
pub struct MeasurementCache {
    state: Mutex<MeasureState>,
    max_entries: usize,
}

impl MeasurementCache {
    pub fn new(config: &MeasureConfig) -> Self {
        Self {
            state: Mutex::new(MeasureState::default()),
            max_entries: config.max_entries.max(1),
        }
    }

    /// Preferred unconstrained size for content with this hash.
    pub fn intrinsic(&self, content_hash: u64) -> Option<(f64, f64)> {
        let mut guard = mutex_lock(&self.state, SOURCE, "intrinsic");
        let state = &mut *guard;
        let seq = state.next_seq();
        match state.intrinsic.get_mut(&content_hash) {
            Some(entry) => {
                entry.seq = seq;
                let size = (entry.width, entry.height);
                state.stats.hits += 1;
                counter!(METRIC_MEASURE_HIT, "map" => "intrinsic").increment(1);
                Some(size)
            }
            None => {
                state.stats.misses += 1;
                counter!(METRIC_MEASURE_MISS, "map" => "intrinsic").increment(1);
                None
            }
        }
    }

    pub fn store_intrinsic(&self, content_hash: u64, width: f64, height: f64) {
        let mut guard = mutex_lock(&self.state, SOURCE, "store_intrinsic");
        let state = &mut *guard;
        let seq = state.next_seq();
        state.intrinsic.insert(
            content_hash,
            IntrinsicEntry { width, height, seq },
        );
        self.evict_locked(state);
    }

    /// Height of content with this hash laid out at `width`, rounded to whole points.
    pub fn constrained_height(&self, content_hash: u64, width: f64) -> Option<f64> {
        let key = (content_hash, round_width(width));
        let mut guard = mutex_lock(&self.state, SOURCE, "constrained_height");
        let state = &mut *guard;
        let seq = state.next_seq();
        match state.constrained.get_mut(&key) {
            Some(entry) => {
                entry.seq = seq;
                let height = entry.height;
                state.stats.hits += 1;
                counter!(METRIC_MEASURE_HIT, "map" => "constrained").increment(1);
                Some(height)
            }
            None => {
                state.stats.misses += 1;
                counter!(METRIC_MEASURE_MISS, "map" => "constrained").increment(1);
                None
            }
        }
    }

    pub fn store_height(&self, content_hash: u64, width: f64, height: f64) {
        let key = (content_hash, round_width(width));
        let mut guard = mutex_lock(&self.state, SOURCE, "store_height");
        let state = &mut *guard;
        let seq = state.next_seq();
        state.constrained.insert(key, ConstrainedEntry { height, seq });
        self.evict_locked(state);
    }

    fn evict_locked(&self, state: &mut MeasureState) {
        let mut evicted = 0_u64;
        while state.len() > self.max_entries {
            let oldest_intrinsic = state
                .intrinsic
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, entry)| (*key, entry.seq));
            let oldest_constrained = state
                .constrained
                .iter()
                .min_by_key(|(_, entry)| entry.seq)
                .map(|(key, entry)| (*key, entry.seq));

            // Ties go to the intrinsic map.
            let victim = match (oldest_intrinsic, oldest_constrained) {
                (Some((key, a)), Some((_, b))) if a <= b => Victim::Intrinsic(key),
                (_, Some((key, _))) => Victim::Constrained(key),
                (Some((key, _)), None) => Victim::Intrinsic(key),
                (None, None) => break,
            };

            match victim {
                Victim::Intrinsic(key) => {
                    state.intrinsic.remove(&key);
                }
                Victim::Constrained(key) => {
                    state.constrained.remove(&key);
                }
            }
            evicted += 1;
        }

        if evicted > 0 {
            state.stats.evictions += evicted;
            counter!(METRIC_MEASURE_EVICT).increment(evicted);
        }
    }

    /// Drop the older half of all measurements.
    pub fn on_memory_pressure(&self) {
        let mut guard = mutex_lock(&self.state, SOURCE, "on_memory_pressure");
        let state = &mut *guard;
        let total = state.len();
        if total == 0 {
            return;
        }

        let mut seqs: Vec<u64> = state
            .intrinsic
            .values()
            .map(|entry| entry.seq)
            .chain(state.constrained.values().map(|entry| entry.seq))
            .collect();
        seqs.sort_unstable();
        // Sequences are unique, so everything at or below the cutoff is exactly the older half.
        let cutoff = seqs[total.div_ceil(2) - 1];
        state.intrinsic.retain(|_, entry| entry.seq > cutoff);
        state.constrained.retain(|_, entry| entry.seq > cutoff);

        let removed = (total - state.len()) as u64;
        state.stats.evictions += removed;
        counter!(METRIC_MEASURE_EVICT).increment(removed);
        debug!(
            op = "measure::on_memory_pressure",
            evicted = removed,
            remaining = state.len(),
            "Trimmed measurement cache after memory warning"
        );
    }

    pub fn clear(&self) {
        let mut state = mutex_lock(&self.state, SOURCE, "clear");
        *state = MeasureState::default();
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    pub fn stats(&self) -> MeasureStats {
        mutex_lock(&self.state, SOURCE, "stats").stats
    }

    pub fn log_stats(&self, context: &str) {
        let state = mutex_lock(&self.state, SOURCE, "log_stats");
        let stats = state.stats;
        debug!(
            op = "measure::stats",
            context,
            intrinsic = state.intrinsic.len(),
            constrained = state.constrained.len(),
            max_entries = self.max_entries,
            hits = stats.hits,
            misses = stats.misses,
            evictions = stats.evictions,
            hit_rate = %format!("{:.1}%", stats.hit_rate()),
            "Measurement cache stats"
        );
    }
}

impl Default for MeasurementCache {
    fn default() -> Self {
        Self::new(&MeasureConfig::default())
    }
}
