use std::sync::Once;

use metrics::{Unit, describe_counter, describe_gauge, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(InfraError::Subscriber)
}

pub fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "mdcache_pool_hit_total",
            Unit::Count,
            "Pooled views reused for identical content."
        );
        describe_counter!(
            "mdcache_pool_fallback_total",
            Unit::Count,
            "Streaming-slot views reused for different content of the same type."
        );
        describe_counter!(
            "mdcache_pool_miss_total",
            Unit::Count,
            "Pool lookups that found no usable view."
        );
        describe_counter!(
            "mdcache_pool_evict_total",
            Unit::Count,
            "Pooled views dropped by expiry, capacity or memory pressure."
        );
        describe_counter!(
            "mdcache_measure_hit_total",
            Unit::Count,
            "Measurement cache hits."
        );
        describe_counter!(
            "mdcache_measure_miss_total",
            Unit::Count,
            "Measurement cache misses."
        );
        describe_counter!(
            "mdcache_measure_evict_total",
            Unit::Count,
            "Measurements evicted due to capacity or memory pressure."
        );
        describe_counter!(
            "mdcache_image_hit_total",
            Unit::Count,
            "Images served without a network fetch, by tier."
        );
        describe_counter!(
            "mdcache_image_fetch_total",
            Unit::Count,
            "Network image fetches attempted."
        );
        describe_counter!(
            "mdcache_image_fetch_failed_total",
            Unit::Count,
            "Network image fetches that produced no usable image."
        );
        describe_gauge!(
            "mdcache_image_disk_bytes",
            Unit::Bytes,
            "Bytes currently held by the image disk tier."
        );
        describe_histogram!(
            "mdcache_image_load_ms",
            Unit::Milliseconds,
            "Latency of image loads that missed the memory tier."
        );
        describe_counter!(
            "mdcache_render_coalesced_total",
            Unit::Count,
            "Render requests superseded by a newer snapshot before rendering."
        );
        describe_counter!(
            "mdcache_render_total",
            Unit::Count,
            "Renders performed, by trigger."
        );
    });
}
