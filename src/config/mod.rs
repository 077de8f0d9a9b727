//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::{NonZeroU64, NonZeroUsize},
    path::PathBuf,
    str::FromStr,
    time::Duration,
};

use clap::Parser;
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

mod cli;

pub use cli::{
    CliArgs, Command, FetchImageArgs, GlobalOverrides, SimulateArgs, StreamingOverrides,
};

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "mdcache";
const DEFAULT_POOL_TTL_SECS: u64 = 30;
const DEFAULT_MEASURE_MAX_ENTRIES: usize = 800;
const DEFAULT_IMAGE_MEMORY_COUNT_LIMIT: usize = 100;
const DEFAULT_DISK_CACHE_SIZE_MB: u64 = 100;
const DEFAULT_DISPLAY_SCALE: f64 = 2.0;
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;
const DEFAULT_TICK_INTERVAL_MS: u64 = 50;

/// Application settings resolved from configuration sources.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub pool: PoolSettings,
    pub measure: MeasureSettings,
    pub images: ImageSettings,
    pub streaming: StreamingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct PoolSettings {
    /// `None` sizes the pool from the device memory tier.
    pub capacity: Option<NonZeroUsize>,
    pub ttl: Duration,
}

#[derive(Debug, Clone)]
pub struct MeasureSettings {
    pub max_entries: NonZeroUsize,
}

#[derive(Debug, Clone)]
pub struct ImageSettings {
    /// `None` sizes the memory tier from the device memory tier.
    pub memory_cache_size_mb: Option<NonZeroU64>,
    pub memory_count_limit: NonZeroUsize,
    pub disk_cache_size_mb: NonZeroU64,
    pub disk_cache_dir: PathBuf,
    pub display_scale: f64,
    pub fetch_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct StreamingSettings {
    pub throttle_interval: Duration,
    /// Cadence of the `simulate` command's chunk emitter.
    pub tick_interval: Duration,
}

/// Errors that can occur while loading settings.
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix("MDCACHE").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    raw.apply_global_overrides(&cli.overrides);
    if let Some(Command::Simulate(args)) = cli.command.as_ref() {
        raw.apply_simulate_overrides(args);
    }

    Settings::from_raw(raw)
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    pool: RawPoolSettings,
    measure: RawMeasureSettings,
    images: RawImageSettings,
    streaming: RawStreamingSettings,
}

impl RawSettings {
    fn apply_global_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(dir) = overrides.disk_cache_dir.as_ref() {
            self.images.disk_cache_dir = Some(dir.clone());
        }
        if let Some(mb) = overrides.disk_cache_size_mb {
            self.images.disk_cache_size_mb = Some(mb);
        }
        if let Some(mb) = overrides.memory_cache_size_mb {
            self.images.memory_cache_size_mb = Some(mb);
        }
        if let Some(capacity) = overrides.pool_capacity {
            self.pool.capacity = Some(capacity);
        }
    }

    fn apply_simulate_overrides(&mut self, args: &SimulateArgs) {
        if let Some(ms) = args.streaming.throttle_ms {
            self.streaming.throttle_interval_ms = Some(ms);
        }
        if let Some(ms) = args.tick_ms {
            self.streaming.tick_interval_ms = Some(ms);
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            pool,
            measure,
            images,
            streaming,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            pool: build_pool_settings(pool)?,
            measure: build_measure_settings(measure)?,
            images: build_image_settings(images)?,
            streaming: build_streaming_settings(streaming)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_pool_settings(pool: RawPoolSettings) -> Result<PoolSettings, LoadError> {
    let capacity = match pool.capacity {
        Some(value) => Some(non_zero_usize(value, "pool.capacity")?),
        None => None,
    };

    let ttl_secs = pool.ttl_seconds.unwrap_or(DEFAULT_POOL_TTL_SECS);
    if ttl_secs == 0 {
        return Err(LoadError::invalid(
            "pool.ttl_seconds",
            "must be greater than zero",
        ));
    }

    Ok(PoolSettings {
        capacity,
        ttl: Duration::from_secs(ttl_secs),
    })
}

fn build_measure_settings(measure: RawMeasureSettings) -> Result<MeasureSettings, LoadError> {
    let max_entries = measure.max_entries.unwrap_or(DEFAULT_MEASURE_MAX_ENTRIES);
    Ok(MeasureSettings {
        max_entries: non_zero_usize(max_entries, "measure.max_entries")?,
    })
}

fn build_image_settings(images: RawImageSettings) -> Result<ImageSettings, LoadError> {
    let memory_cache_size_mb = match images.memory_cache_size_mb {
        Some(value) => Some(NonZeroU64::new(value).ok_or_else(|| {
            LoadError::invalid("images.memory_cache_size_mb", "must be greater than zero")
        })?),
        None => None,
    };

    let memory_count_limit = non_zero_usize(
        images
            .memory_count_limit
            .unwrap_or(DEFAULT_IMAGE_MEMORY_COUNT_LIMIT),
        "images.memory_count_limit",
    )?;

    let disk_cache_size_mb = NonZeroU64::new(
        images
            .disk_cache_size_mb
            .unwrap_or(DEFAULT_DISK_CACHE_SIZE_MB),
    )
    .ok_or_else(|| LoadError::invalid("images.disk_cache_size_mb", "must be greater than zero"))?;

    let disk_cache_dir = images.disk_cache_dir.unwrap_or_else(|| {
        std::env::temp_dir().join(crate::cache::config::DEFAULT_DISK_CACHE_DIRNAME)
    });
    if disk_cache_dir.as_os_str().is_empty() {
        return Err(LoadError::invalid(
            "images.disk_cache_dir",
            "path must not be empty",
        ));
    }

    let display_scale = images.display_scale.unwrap_or(DEFAULT_DISPLAY_SCALE);
    if !display_scale.is_finite() || display_scale <= 0.0 {
        return Err(LoadError::invalid(
            "images.display_scale",
            "must be a positive number",
        ));
    }

    let fetch_timeout_secs = images
        .fetch_timeout_seconds
        .unwrap_or(DEFAULT_FETCH_TIMEOUT_SECS);
    if fetch_timeout_secs == 0 {
        return Err(LoadError::invalid(
            "images.fetch_timeout_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ImageSettings {
        memory_cache_size_mb,
        memory_count_limit,
        disk_cache_size_mb,
        disk_cache_dir,
        display_scale,
        fetch_timeout: Duration::from_secs(fetch_timeout_secs),
    })
}

fn build_streaming_settings(
    streaming: RawStreamingSettings,
) -> Result<StreamingSettings, LoadError> {
    let throttle_ms = streaming
        .throttle_interval_ms
        .unwrap_or(DEFAULT_THROTTLE_INTERVAL_MS);
    if throttle_ms == 0 {
        return Err(LoadError::invalid(
            "streaming.throttle_interval_ms",
            "must be greater than zero",
        ));
    }

    let tick_ms = streaming
        .tick_interval_ms
        .unwrap_or(DEFAULT_TICK_INTERVAL_MS);

    Ok(StreamingSettings {
        throttle_interval: Duration::from_millis(throttle_ms),
        tick_interval: Duration::from_millis(tick_ms),
    })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawPoolSettings {
    capacity: Option<usize>,
    ttl_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawMeasureSettings {
    max_entries: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawImageSettings {
    memory_cache_size_mb: Option<u64>,
    memory_count_limit: Option<usize>,
    disk_cache_size_mb: Option<u64>,
    disk_cache_dir: Option<PathBuf>,
    display_scale: Option<f64>,
    fetch_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStreamingSettings {
    throttle_interval_ms: Option<u64>,
    tick_interval_ms: Option<u64>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
