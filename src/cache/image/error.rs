use thiserror::Error;

use super::fetch::FetchError;

/// Failures inside the image pipeline.
///
/// None of these reach callers of [`ImageCache`](super::ImageCache): every failure is logged and
/// degrades to an empty result so the next request tries again.
#[derive(Debug, Error)]
pub enum ImageCacheError {
    #[error("unsupported image source `{source_id}`: {reason}")]
    InvalidSource {
        source_id: String,
        reason: &'static str,
    },
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("payload is not a recognised image")]
    NotAnImage,
    #[error("failed to decode image: {0}")]
    Decode(#[from] image::ImageError),
    #[error("failed to decode png: {0}")]
    Png(#[from] png::DecodingError),
    #[error("failed to decode jpeg: {0}")]
    Jpeg(#[from] jpeg_decoder::Error),
    #[error("decoder returned {len} bytes for a {width}x{height} bitmap")]
    Malformed { width: u32, height: u32, len: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("background task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl ImageCacheError {
    pub(crate) fn invalid_source(source_id: impl Into<String>, reason: &'static str) -> Self {
        Self::InvalidSource {
            source_id: source_id.into(),
            reason,
        }
    }

    /// Stable label for log fields.
    pub fn code(&self) -> &'static str {
        match self {
            ImageCacheError::InvalidSource { .. } => "invalid_source",
            ImageCacheError::Fetch(_) => "fetch",
            ImageCacheError::NotAnImage => "not_an_image",
            ImageCacheError::Decode(_)
            | ImageCacheError::Png(_)
            | ImageCacheError::Jpeg(_)
            | ImageCacheError::Malformed { .. } => "decode",
            ImageCacheError::Io(_) => "io",
            ImageCacheError::Join(_) => "join",
        }
    }
}
