//! Network seam of the image cache.

use std::error::Error as StdError;
use std::path::PathBuf;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use url::Url;

/// Errors surfaced by an [`ImageFetcher`].
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: Box<dyn StdError + Send + Sync>,
    },
    #[error("response from {url} is empty")]
    EmptyBody { url: String },
}

impl FetchError {
    pub fn transport(url: &Url, source: impl StdError + Send + Sync + 'static) -> Self {
        Self::Transport {
            url: url.to_string(),
            source: Box::new(source),
        }
    }
}

/// Retrieves raw encoded image bytes for remote sources.
///
/// Implementations perform a single attempt; the cache never retries on their behalf.
#[async_trait]
pub trait ImageFetcher: Send + Sync {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError>;
}

/// Where an image source identifier points.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageSource {
    Local(PathBuf),
    Remote(Url),
}

impl ImageSource {
    /// Classify a source identifier.
    ///
    /// `http`/`https` URLs are remote, `file` URLs and anything that does not parse as a URL are
    /// local paths. Single-letter schemes are treated as drive letters.
    pub fn parse(source: &str) -> Option<Self> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return None;
        }
        match Url::parse(trimmed) {
            Ok(url) => match url.scheme() {
                "http" | "https" => Some(ImageSource::Remote(url)),
                "file" => url.to_file_path().ok().map(ImageSource::Local),
                scheme if scheme.len() == 1 => Some(ImageSource::Local(PathBuf::from(trimmed))),
                _ => None,
            },
            Err(_) => Some(ImageSource::Local(PathBuf::from(trimmed))),
        }
    }
}
