//! Two-tier cache of decoded, display-sized images.
//!
//! Lookups resolve in order: decoded bitmap in memory, local file, encoded bytes on disk, network.
//! Every path downsamples at decode time, so nothing larger than the requested display size times
//! the display scale is ever retained.

mod decode;
mod disk;
mod error;
mod fetch;
mod memory;
mod slot;

use std::sync::{Arc, Mutex};
use std::time::Instant;

use bytes::Bytes;
use metrics::{counter, histogram};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

pub use decode::{DecodedImage, TargetSize};
pub use error::ImageCacheError;
pub use fetch::{FetchError, ImageFetcher, ImageSource};
pub use slot::{ImageSlot, SlotToken};

use self::decode::decode_downsampled;
use self::disk::{DiskTier, disk_key};
use self::memory::{MemoryKey, MemoryTierCache};
use super::config::ImageCacheConfig;
use super::lock::mutex_lock;

const SOURCE: &str = "cache::image";

const METRIC_IMAGE_HIT: &str = "mdcache_image_hit_total";
const METRIC_IMAGE_FETCH: &str = "mdcache_image_fetch_total";
const METRIC_IMAGE_FETCH_FAILED: &str = "mdcache_image_fetch_failed_total";
const METRIC_IMAGE_LOAD_MS: &str = "mdcache_image_load_ms";

/// Counters describing where image requests were served from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ImageStats {
    pub memory_hits: u64,
    pub local_loads: u64,
    pub disk_hits: u64,
    pub network_fetches: u64,
    pub failures: u64,
}

impl ImageStats {
    /// Percentage of requests answered without touching the network or the local filesystem.
    pub fn hit_rate(&self) -> f64 {
        let total =
            self.memory_hits + self.local_loads + self.disk_hits + self.network_fetches + self.failures;
        if total == 0 {
            0.0
        } else {
            (self.memory_hits + self.disk_hits) as f64 / total as f64 * 100.0
        }
    }
}

/// Which step of the lookup produced an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Tier {
    Local,
    Disk,
    Network,
}

impl Tier {
    fn as_str(self) -> &'static str {
        match self {
            Tier::Local => "local",
            Tier::Disk => "disk",
            Tier::Network => "network",
        }
    }
}

/// Shared image cache; one instance typically serves every rendering surface.
pub struct ImageCache {
    memory: Mutex<MemoryTierCache>,
    disk: Mutex<Arc<DiskTier>>,
    fetcher: Arc<dyn ImageFetcher>,
    config: Mutex<ImageCacheConfig>,
    stats: Mutex<ImageStats>,
    runtime: Handle,
}

impl ImageCache {
    /// Open the cache, creating and indexing the disk directory.
    ///
    /// Must be called from within a tokio runtime; background loads are spawned onto it.
    pub async fn open(
        config: ImageCacheConfig,
        fetcher: Arc<dyn ImageFetcher>,
    ) -> Result<Self, ImageCacheError> {
        let disk = DiskTier::open(config.disk_cache_directory.clone(), config.disk_budget_bytes())
            .await?;
        let memory =
            MemoryTierCache::new(config.memory_budget_bytes(), config.memory_count_limit_non_zero());

        info!(
            op = "image::open",
            memory_budget_bytes = config.memory_budget_bytes(),
            memory_count_limit = config.memory_count_limit,
            disk_budget_bytes = config.disk_budget_bytes(),
            display_scale = config.display_scale,
            "Image cache ready"
        );

        Ok(Self {
            memory: Mutex::new(memory),
            disk: Mutex::new(Arc::new(disk)),
            fetcher,
            config: Mutex::new(config),
            stats: Mutex::new(ImageStats::default()),
            runtime: Handle::current(),
        })
    }

    fn disk_tier(&self) -> Arc<DiskTier> {
        Arc::clone(&mutex_lock(&self.disk, SOURCE, "disk_tier"))
    }

    fn display_scale(&self) -> f64 {
        mutex_lock(&self.config, SOURCE, "display_scale").display_scale
    }

    fn record(&self, update: impl FnOnce(&mut ImageStats)) {
        let mut stats = mutex_lock(&self.stats, SOURCE, "stats.record");
        update(&mut *stats);
    }

    /// Memory-tier lookup only; never blocks on I/O.
    pub fn cached(&self, source: &str, target: TargetSize) -> Option<Arc<DecodedImage>> {
        let key: MemoryKey = (source.to_string(), target);
        let hit = mutex_lock(&self.memory, SOURCE, "cached").get(&key);
        if hit.is_some() {
            self.record(|stats| stats.memory_hits += 1);
            counter!(METRIC_IMAGE_HIT, "tier" => "memory").increment(1);
        }
        hit
    }

    /// Resolve an image through every tier.
    ///
    /// Failures are logged and reported as `None`; nothing is remembered about them, so a later
    /// call tries again.
    pub async fn image(&self, source: &str, target: TargetSize) -> Option<Arc<DecodedImage>> {
        if let Some(image) = self.cached(source, target) {
            return Some(image);
        }

        let started = Instant::now();
        match self.load(source, target).await {
            Ok((image, tier)) => {
                let elapsed_ms = started.elapsed().as_millis() as u64;
                histogram!(METRIC_IMAGE_LOAD_MS, "tier" => tier.as_str()).record(elapsed_ms as f64);
                let image = Arc::new(image);
                let evicted = mutex_lock(&self.memory, SOURCE, "image.insert")
                    .insert((source.to_string(), target), Arc::clone(&image));
                debug!(
                    op = "image::fetch",
                    result = "loaded",
                    tier = tier.as_str(),
                    width = image.width(),
                    height = image.height(),
                    memory_evicted = evicted,
                    elapsed_ms,
                    "Image decoded into memory tier"
                );
                Some(image)
            }
            Err(err) => {
                self.record(|stats| stats.failures += 1);
                warn!(
                    op = "image::fetch",
                    result = "failed",
                    error_code = err.code(),
                    error = %err,
                    source_id = source,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Image unavailable"
                );
                None
            }
        }
    }

    async fn load(
        &self,
        source: &str,
        target: TargetSize,
    ) -> Result<(DecodedImage, Tier), ImageCacheError> {
        let max_dimension = target.max_pixel_dimension(self.display_scale());
        let parsed = ImageSource::parse(source)
            .ok_or_else(|| ImageCacheError::invalid_source(source, "unsupported scheme"))?;

        let url = match parsed {
            ImageSource::Local(path) => {
                let data = tokio::fs::read(&path).await?;
                let image = decode_off_thread(Bytes::from(data), max_dimension).await?;
                self.record(|stats| stats.local_loads += 1);
                counter!(METRIC_IMAGE_HIT, "tier" => "local").increment(1);
                return Ok((image, Tier::Local));
            }
            ImageSource::Remote(url) => url,
        };

        let disk = self.disk_tier();
        let key = disk_key(source);
        if let Some(data) = disk.read(&key).await {
            match decode_off_thread(data, max_dimension).await {
                Ok(image) => {
                    self.record(|stats| stats.disk_hits += 1);
                    counter!(METRIC_IMAGE_HIT, "tier" => "disk").increment(1);
                    return Ok((image, Tier::Disk));
                }
                Err(err) => {
                    warn!(
                        op = "image::fetch",
                        result = "disk_corrupt",
                        error = %err,
                        source_id = source,
                        "Cached image bytes unreadable; refetching"
                    );
                    disk.discard(&key).await;
                }
            }
        }

        counter!(METRIC_IMAGE_FETCH).increment(1);
        let data = match self.fetcher.fetch(&url).await {
            Ok(data) => data,
            Err(err) => {
                counter!(METRIC_IMAGE_FETCH_FAILED).increment(1);
                return Err(err.into());
            }
        };
        if data.is_empty() || imagesize::blob_size(&data).is_err() {
            counter!(METRIC_IMAGE_FETCH_FAILED).increment(1);
            return Err(ImageCacheError::NotAnImage);
        }
        self.record(|stats| stats.network_fetches += 1);

        if let Err(err) = disk.store(&key, data.clone()).await {
            warn!(
                op = "image::fetch",
                result = "persist_failed",
                error = %err,
                source_id = source,
                "Failed to persist fetched image; serving from memory only"
            );
        }

        let image = decode_off_thread(data, max_dimension).await?;
        Ok((image, Tier::Network))
    }

    /// Resolve an image and hand the result to `on_complete`.
    ///
    /// A memory hit completes inline on the calling thread. Anything else runs on the cache's
    /// runtime and `on_complete` is invoked from there.
    pub fn fetch_image<F>(self: &Arc<Self>, source: impl Into<String>, target: TargetSize, on_complete: F)
    where
        F: FnOnce(Option<Arc<DecodedImage>>) + Send + 'static,
    {
        let source = source.into();
        if let Some(image) = self.cached(&source, target) {
            on_complete(Some(image));
            return;
        }

        let cache = Arc::clone(self);
        self.runtime.spawn(async move {
            let image = cache.image(&source, target).await;
            on_complete(image);
        });
    }

    /// Like [`fetch_image`](Self::fetch_image) but delivers through a oneshot channel.
    pub fn request(
        self: &Arc<Self>,
        source: impl Into<String>,
        target: TargetSize,
    ) -> oneshot::Receiver<Option<Arc<DecodedImage>>> {
        let (tx, rx) = oneshot::channel();
        self.fetch_image(source, target, move |image| {
            let _ = tx.send(image);
        });
        rx
    }

    /// Load into `slot`, dropping the result if the slot moved on before it arrived.
    pub fn fetch_into_slot(
        self: &Arc<Self>,
        slot: &Arc<ImageSlot>,
        source: impl Into<String>,
        target: TargetSize,
    ) -> SlotToken {
        let token = slot.begin();
        let slot = Arc::clone(slot);
        self.fetch_image(source, target, move |image| {
            if !slot.deliver(token, image) {
                debug!(
                    op = "image::fetch_into_slot",
                    result = "stale",
                    "Dropped image for recycled slot"
                );
            }
        });
        token
    }

    /// Drop every decoded bitmap. The disk tier is untouched.
    pub fn on_memory_pressure(&self) {
        let mut memory = mutex_lock(&self.memory, SOURCE, "on_memory_pressure");
        let dropped = memory.len();
        let freed = memory.total_cost();
        memory.clear();
        info!(
            op = "image::on_memory_pressure",
            dropped,
            freed_bytes = freed,
            "Cleared image memory tier"
        );
    }

    /// Wipe both tiers.
    pub async fn clear_all(&self) -> Result<(), ImageCacheError> {
        mutex_lock(&self.memory, SOURCE, "clear_all").clear();
        let disk = self.disk_tier();
        disk.clear().await?;
        info!(
            op = "image::clear_all",
            dir = %disk.dir().display(),
            "Cleared image memory and disk tiers"
        );
        Ok(())
    }

    /// Bytes currently held by the disk tier.
    pub fn current_disk_cache_size(&self) -> u64 {
        self.disk_tier().total_bytes()
    }

    pub fn disk_cache_directory(&self) -> std::path::PathBuf {
        self.disk_tier().dir().to_path_buf()
    }

    /// Number of decoded images in memory.
    pub fn memory_len(&self) -> usize {
        mutex_lock(&self.memory, SOURCE, "memory_len").len()
    }

    pub fn memory_cost(&self) -> u64 {
        mutex_lock(&self.memory, SOURCE, "memory_cost").total_cost()
    }

    /// Apply new budgets. A different disk directory is opened and indexed from scratch.
    pub async fn reconfigure(&self, config: ImageCacheConfig) -> Result<(), ImageCacheError> {
        let current = mutex_lock(&self.config, SOURCE, "reconfigure.read").clone();
        if current == config {
            return Ok(());
        }

        mutex_lock(&self.memory, SOURCE, "reconfigure.memory").set_limits(
            config.memory_budget_bytes(),
            config.memory_count_limit_non_zero(),
        );

        if current.disk_cache_directory != config.disk_cache_directory {
            let disk =
                DiskTier::open(config.disk_cache_directory.clone(), config.disk_budget_bytes())
                    .await?;
            *mutex_lock(&self.disk, SOURCE, "reconfigure.disk") = Arc::new(disk);
        } else if current.disk_cache_size_mb != config.disk_cache_size_mb {
            self.disk_tier().set_budget(config.disk_budget_bytes()).await;
        }

        info!(
            op = "image::reconfigure",
            memory_budget_bytes = config.memory_budget_bytes(),
            disk_budget_bytes = config.disk_budget_bytes(),
            dir = %config.disk_cache_directory.display(),
            "Image cache reconfigured"
        );
        *mutex_lock(&self.config, SOURCE, "reconfigure.write") = config;
        Ok(())
    }

    pub fn stats(&self) -> ImageStats {
        *mutex_lock(&self.stats, SOURCE, "stats")
    }

    pub fn log_stats(&self, context: &str) {
        let stats = self.stats();
        debug!(
            op = "image::stats",
            context,
            memory_images = self.memory_len(),
            memory_bytes = self.memory_cost(),
            disk_bytes = self.current_disk_cache_size(),
            memory_hits = stats.memory_hits,
            disk_hits = stats.disk_hits,
            local_loads = stats.local_loads,
            network_fetches = stats.network_fetches,
            failures = stats.failures,
            hit_rate = %format!("{:.1}%", stats.hit_rate()),
            "Image cache stats"
        );
    }
}

async fn decode_off_thread(data: Bytes, max_dimension: u32) -> Result<DecodedImage, ImageCacheError> {
    tokio::task::spawn_blocking(move || decode_downsampled(&data, max_dimension)).await?
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tempfile::TempDir;
    use url::Url;

    use super::decode::encode_png;
    use super::*;

    struct StaticFetcher {
        body: Bytes,
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageFetcher for StaticFetcher {
        async fn fetch(&self, _url: &Url) -> Result<Bytes, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.body.clone())
        }
    }

    fn config(dir: &TempDir) -> ImageCacheConfig {
        ImageCacheConfig {
            memory_cache_size_mb: Some(8),
            memory_count_limit: 10,
            disk_cache_size_mb: 4,
            disk_cache_directory: dir.path().join("images"),
            display_scale: 1.0,
        }
    }

    async fn open(dir: &TempDir, body: Bytes) -> (Arc<ImageCache>, Arc<StaticFetcher>) {
        let fetcher = Arc::new(StaticFetcher {
            body,
            calls: AtomicUsize::new(0),
        });
        let cache = ImageCache::open(config(dir), fetcher.clone())
            .await
            .expect("open cache");
        (Arc::new(cache), fetcher)
    }

    #[tokio::test]
    async fn remote_image_is_fetched_once_then_served_from_memory() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, fetcher) = open(&dir, Bytes::from(encode_png(64, 32))).await;
        let target = TargetSize::new(16, 16);

        let first = cache
            .image("https://example.com/a.png", target)
            .await
            .expect("first");
        let second = cache
            .image("https://example.com/a.png", target)
            .await
            .expect("second");

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!((first.width(), first.height()), (16, 8));
        assert!(cache.current_disk_cache_size() > 0);
    }

    #[tokio::test]
    async fn other_size_is_served_from_disk() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, fetcher) = open(&dir, Bytes::from(encode_png(64, 64))).await;

        cache
            .image("https://example.com/a.png", TargetSize::new(8, 8))
            .await
            .expect("small");
        let large = cache
            .image("https://example.com/a.png", TargetSize::new(32, 32))
            .await
            .expect("large");

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
        assert_eq!(large.width(), 32);
        assert_eq!(cache.stats().disk_hits, 1);
    }

    #[tokio::test]
    async fn invalid_payload_is_not_cached() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, fetcher) = open(&dir, Bytes::from_static(b"<html>nope</html>")).await;
        let target = TargetSize::new(8, 8);

        assert!(cache.image("https://example.com/a.png", target).await.is_none());
        assert!(cache.image("https://example.com/a.png", target).await.is_none());

        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.current_disk_cache_size(), 0);
        assert_eq!(cache.stats().failures, 2);
    }

    #[tokio::test]
    async fn local_files_decode_without_fetcher() {
        let dir = TempDir::new().expect("tempdir");
        let path = dir.path().join("local.png");
        std::fs::write(&path, encode_png(40, 20)).expect("write png");
        let (cache, fetcher) = open(&dir, Bytes::new()).await;

        let image = cache
            .image(path.to_str().expect("utf8 path"), TargetSize::new(10, 10))
            .await
            .expect("local image");

        assert_eq!((image.width(), image.height()), (10, 5));
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 0);
        assert_eq!(cache.current_disk_cache_size(), 0);
    }

    #[tokio::test]
    async fn memory_pressure_keeps_disk() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, fetcher) = open(&dir, Bytes::from(encode_png(8, 8))).await;
        let target = TargetSize::new(8, 8);
        cache.image("https://example.com/a.png", target).await.expect("load");

        cache.on_memory_pressure();
        assert_eq!(cache.memory_len(), 0);
        assert!(cache.current_disk_cache_size() > 0);

        cache.image("https://example.com/a.png", target).await.expect("reload");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fetch_image_delivers_through_channel() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, _) = open(&dir, Bytes::from(encode_png(8, 8))).await;

        let rx = cache.request("https://example.com/a.png", TargetSize::new(4, 4));
        let image = rx.await.expect("completion").expect("image");
        assert_eq!(image.width(), 4);

        let rx = cache.request("https://example.com/a.png", TargetSize::new(4, 4));
        assert!(rx.await.expect("completion").is_some());
        assert_eq!(cache.stats().memory_hits, 1);
    }

    #[tokio::test]
    async fn clear_all_wipes_both_tiers() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, fetcher) = open(&dir, Bytes::from(encode_png(8, 8))).await;
        let target = TargetSize::new(8, 8);
        cache.image("https://example.com/a.png", target).await.expect("load");

        cache.clear_all().await.expect("clear");

        assert_eq!(cache.memory_len(), 0);
        assert_eq!(cache.current_disk_cache_size(), 0);
        cache.image("https://example.com/a.png", target).await.expect("refetch");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn reconfigure_to_new_directory_starts_empty() {
        let dir = TempDir::new().expect("tempdir");
        let (cache, _) = open(&dir, Bytes::from(encode_png(8, 8))).await;
        cache
            .image("https://example.com/a.png", TargetSize::new(8, 8))
            .await
            .expect("load");

        let mut next = config(&dir);
        next.disk_cache_directory = dir.path().join("elsewhere");
        cache.reconfigure(next).await.expect("reconfigure");

        assert_eq!(cache.current_disk_cache_size(), 0);
        assert_eq!(cache.disk_cache_directory(), dir.path().join("elsewhere"));
    }

    #[test]
    fn hit_rate_counts_memory_and_disk() {
        let stats = ImageStats {
            memory_hits: 2,
            disk_hits: 1,
            network_fetches: 1,
            ..Default::default()
        };
        assert!((stats.hit_rate() - 75.0).abs() < f64::EPSILON);
    }
}
