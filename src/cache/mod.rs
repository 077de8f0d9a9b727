//! Render-path caches.
//!
//! Everything a streaming markdown renderer needs to make repeated re-renders cheap:
//!
//! - [`AttachmentPool`]: reuses block views keyed by the content they display
//! - [`MeasurementCache`]: memoizes table cell measurements
//! - [`ImageCache`]: decoded images in memory over raw bytes on disk
//!
//! ## Configuration
//!
//! Budgets come from `mdcache.toml`:
//!
//! ```toml
//! [pool]
//! ttl_seconds = 30
//!
//! [measure]
//! max_entries = 800
//!
//! [images]
//! disk_cache_size_mb = 100
//! # ... see config.rs for all options
//! ```

mod clock;
pub(crate) mod config;
pub mod image;
mod keys;
pub(crate) mod lock;
mod measure;
mod pool;
mod view;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ImageCacheConfig, MeasureConfig, PoolConfig};
pub use image::{
    DecodedImage, FetchError, ImageCache, ImageCacheError, ImageFetcher, ImageSlot, ImageSource,
    ImageStats, SlotToken, TargetSize,
};
pub use keys::{ContentKey, hash_value, round_width};
pub use measure::{MeasureStats, MeasurementCache};
pub use pool::{AttachmentPool, PoolStats};
pub use view::PooledView;
