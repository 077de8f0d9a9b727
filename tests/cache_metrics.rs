mod support;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use mdcache::application::render::{CoalescerConfig, RenderCoalescer, RuleView};
use mdcache::cache::{
    AttachmentPool, ContentKey, ImageCache, ImageCacheConfig, MeasureConfig, MeasurementCache,
    PoolConfig, TargetSize,
};
use metrics_util::debugging::DebuggingRecorder;
use support::{FakeFetcher, png};
use tempfile::TempDir;

#[tokio::test]
async fn cache_paths_emit_expected_metric_keys() {
    let recorder = DebuggingRecorder::new();
    let snapshotter = recorder.snapshotter();
    recorder
        .install()
        .expect("debug metrics recorder should install in this test process");

    // Pool hit/miss/fallback/evict
    let pool = AttachmentPool::new(&PoolConfig {
        capacity: Some(1),
        ttl: Duration::from_secs(30),
    });
    let narrow = ContentKey::rule(100.0, false);
    let wide = ContentKey::rule(200.0, false);
    assert!(pool.dequeue::<RuleView>(&narrow, false).is_none());
    pool.recycle(Box::new(RuleView), narrow.clone(), false);
    pool.recycle(Box::new(RuleView), wide.clone(), false);
    assert!(pool.dequeue::<RuleView>(&wide, false).is_some());
    pool.recycle(Box::new(RuleView), narrow.clone(), true);
    assert!(pool.dequeue::<RuleView>(&wide, true).is_some());

    // Measurement hit/miss/evict
    let measurements = MeasurementCache::new(&MeasureConfig { max_entries: 1 });
    assert!(measurements.intrinsic(1).is_none());
    measurements.store_intrinsic(1, 10.0, 18.0);
    assert!(measurements.intrinsic(1).is_some());
    measurements.store_height(2, 100.0, 36.0);

    // Image fetch, hit, failure, disk gauge and load latency
    let dir = TempDir::new().expect("tempdir");
    let fetcher = Arc::new(FakeFetcher::default().with("https://example.com/a.png", png(8, 8)));
    let images = ImageCache::open(
        ImageCacheConfig {
            disk_cache_directory: dir.path().join("images"),
            display_scale: 1.0,
            ..ImageCacheConfig::default()
        },
        fetcher,
    )
    .await
    .expect("image cache");
    let target = TargetSize::new(8, 8);
    assert!(images.image("https://example.com/a.png", target).await.is_some());
    assert!(images.image("https://example.com/a.png", target).await.is_some());
    assert!(images.image("https://example.com/gone.png", target).await.is_none());

    // Coalesced and flushed renders
    let coalescer = RenderCoalescer::new(CoalescerConfig::default(), |_: u32| {});
    coalescer.notify(1);
    coalescer.notify(2);
    assert!(coalescer.flush());

    let names: HashSet<String> = snapshotter
        .snapshot()
        .into_vec()
        .into_iter()
        .map(|(composite_key, _, _, _)| composite_key.key().name().to_string())
        .collect();

    let expected = [
        "mdcache_pool_hit_total",
        "mdcache_pool_fallback_total",
        "mdcache_pool_miss_total",
        "mdcache_pool_evict_total",
        "mdcache_measure_hit_total",
        "mdcache_measure_miss_total",
        "mdcache_measure_evict_total",
        "mdcache_image_hit_total",
        "mdcache_image_fetch_total",
        "mdcache_image_fetch_failed_total",
        "mdcache_image_disk_bytes",
        "mdcache_image_load_ms",
        "mdcache_render_coalesced_total",
        "mdcache_render_total",
    ];

    for metric in expected {
        assert!(names.contains(metric), "missing metric: {metric}");
    }
}
