//! Cache configuration.
//!
//! Controls the attachment pool, measurement cache and image cache. Values come from the
//! `[pool]`, `[measure]` and `[images]` tables of `mdcache.toml` via [`crate::config`].

use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use crate::infra::memory::MemoryTier;

// Default values for cache configuration
const DEFAULT_POOL_TTL_SECS: u64 = 30;
const DEFAULT_MEASURE_MAX_ENTRIES: usize = 800;
const DEFAULT_IMAGE_MEMORY_COUNT_LIMIT: usize = 100;
const DEFAULT_DISK_CACHE_SIZE_MB: u64 = 100;
const DEFAULT_DISPLAY_SCALE: f64 = 2.0;
pub(crate) const DEFAULT_DISK_CACHE_DIRNAME: &str = "mdcache-images";

const BYTES_PER_MB: u64 = 1024 * 1024;

/// Attachment pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum pooled views; `None` derives it from the device memory tier.
    pub capacity: Option<usize>,
    /// Entries older than this are dropped on the next eviction pass.
    pub ttl: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: None,
            ttl: Duration::from_secs(DEFAULT_POOL_TTL_SECS),
        }
    }
}

impl From<&crate::config::PoolSettings> for PoolConfig {
    fn from(settings: &crate::config::PoolSettings) -> Self {
        Self {
            capacity: settings.capacity.map(NonZeroUsize::get),
            ttl: settings.ttl,
        }
    }
}

impl PoolConfig {
    /// Resolved capacity, clamped to at least one view.
    pub fn effective_capacity(&self) -> usize {
        self.capacity
            .unwrap_or_else(|| MemoryTier::detect().pool_capacity())
            .max(1)
    }
}

/// Measurement cache configuration.
#[derive(Debug, Clone)]
pub struct MeasureConfig {
    /// Combined entry ceiling across the intrinsic and constrained maps.
    pub max_entries: usize,
}

impl Default for MeasureConfig {
    fn default() -> Self {
        Self {
            max_entries: DEFAULT_MEASURE_MAX_ENTRIES,
        }
    }
}

impl From<&crate::config::MeasureSettings> for MeasureConfig {
    fn from(settings: &crate::config::MeasureSettings) -> Self {
        Self {
            max_entries: settings.max_entries.get(),
        }
    }
}

/// Image cache configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageCacheConfig {
    /// Decoded-bitmap budget in MiB; `None` derives it from the device memory tier.
    pub memory_cache_size_mb: Option<u64>,
    /// Ceiling on decoded images held in memory regardless of their cost.
    pub memory_count_limit: usize,
    /// Raw encoded bytes allowed on disk, in MiB.
    pub disk_cache_size_mb: u64,
    /// Directory holding the disk tier.
    pub disk_cache_directory: PathBuf,
    /// Device pixels per layout point; decode targets are multiplied by it.
    pub display_scale: f64,
}

impl Default for ImageCacheConfig {
    fn default() -> Self {
        Self {
            memory_cache_size_mb: None,
            memory_count_limit: DEFAULT_IMAGE_MEMORY_COUNT_LIMIT,
            disk_cache_size_mb: DEFAULT_DISK_CACHE_SIZE_MB,
            disk_cache_directory: std::env::temp_dir().join(DEFAULT_DISK_CACHE_DIRNAME),
            display_scale: DEFAULT_DISPLAY_SCALE,
        }
    }
}

impl From<&crate::config::ImageSettings> for ImageCacheConfig {
    fn from(settings: &crate::config::ImageSettings) -> Self {
        Self {
            memory_cache_size_mb: settings.memory_cache_size_mb.map(|value| value.get()),
            memory_count_limit: settings.memory_count_limit.get(),
            disk_cache_size_mb: settings.disk_cache_size_mb.get(),
            disk_cache_directory: settings.disk_cache_dir.clone(),
            display_scale: settings.display_scale,
        }
    }
}

impl ImageCacheConfig {
    pub fn memory_budget_bytes(&self) -> u64 {
        match self.memory_cache_size_mb {
            Some(mb) => mb.saturating_mul(BYTES_PER_MB),
            None => MemoryTier::detect().image_memory_budget_bytes(),
        }
    }

    pub fn disk_budget_bytes(&self) -> u64 {
        self.disk_cache_size_mb.saturating_mul(BYTES_PER_MB)
    }

    /// Returns the memory count limit as NonZeroUsize, clamping to 1 if zero.
    pub fn memory_count_limit_non_zero(&self) -> NonZeroUsize {
        NonZeroUsize::new(self.memory_count_limit).unwrap_or(NonZeroUsize::MIN)
    }
}
