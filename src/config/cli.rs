use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};

/// Command-line arguments for the mdcache binary.
#[derive(Debug, Parser)]
#[command(
    name = "mdcache",
    version,
    about = "Render caches for streaming markdown documents"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "MDCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Stream a markdown file through the renderer and report cache statistics.
    Simulate(SimulateArgs),
    /// Load one image through the memory, disk and network tiers.
    #[command(name = "fetch-image")]
    FetchImage(FetchImageArgs),
    /// Print the size of the on-disk image cache.
    #[command(name = "disk-usage")]
    DiskUsage,
    /// Remove every cached image from memory and disk.
    Clear,
}

#[derive(Debug, Args, Clone)]
pub struct SimulateArgs {
    /// Markdown document to stream.
    #[arg(value_name = "FILE", value_hint = ValueHint::FilePath)]
    pub file: PathBuf,

    /// Layout width in points.
    #[arg(long, default_value_t = 640.0)]
    pub width: f64,

    /// Delay between streamed chunks in milliseconds.
    #[arg(long = "tick-ms", value_name = "MS")]
    pub tick_ms: Option<u64>,

    #[command(flatten)]
    pub streaming: StreamingOverrides,
}

#[derive(Debug, Args, Clone)]
pub struct FetchImageArgs {
    /// Remote URL, `file://` URL or local path.
    #[arg(value_name = "SOURCE")]
    pub source: String,

    /// Target width in points.
    #[arg(long, default_value_t = 320)]
    pub width: u32,

    /// Target height in points.
    #[arg(long, default_value_t = 240)]
    pub height: u32,
}

#[derive(Debug, Args, Default, Clone)]
pub struct StreamingOverrides {
    /// Override the render throttle interval in milliseconds.
    #[arg(long = "throttle-ms", value_name = "MS")]
    pub throttle_ms: Option<u64>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the log level (trace, debug, info, warn, error).
    #[arg(long = "log-level", global = true, value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        global = true,
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override the directory holding the disk image cache.
    #[arg(
        long = "disk-cache-dir",
        global = true,
        value_name = "PATH",
        value_hint = ValueHint::DirPath
    )]
    pub disk_cache_dir: Option<PathBuf>,

    /// Override the disk image cache budget in MiB.
    #[arg(long = "disk-cache-size-mb", global = true, value_name = "MB")]
    pub disk_cache_size_mb: Option<u64>,

    /// Override the decoded image memory budget in MiB.
    #[arg(long = "memory-cache-size-mb", global = true, value_name = "MB")]
    pub memory_cache_size_mb: Option<u64>,

    /// Override the attachment pool capacity.
    #[arg(long = "pool-capacity", global = true, value_name = "VIEWS")]
    pub pool_capacity: Option<usize>,
}
