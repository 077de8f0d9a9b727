//! Shared fixtures for integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bytes::Bytes;
use image::{ImageFormat, Rgba, RgbaImage};
use mdcache::cache::{FetchError, ImageFetcher};
use url::Url;

/// Serves canned bodies by URL and counts every request.
#[derive(Default)]
pub struct FakeFetcher {
    bodies: Mutex<HashMap<String, Bytes>>,
    calls: AtomicUsize,
}

impl FakeFetcher {
    pub fn with(mut self, url: &str, body: Bytes) -> Self {
        self.bodies
            .get_mut()
            .expect("bodies")
            .insert(url.to_string(), body);
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ImageFetcher for FakeFetcher {
    async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.bodies
            .lock()
            .expect("bodies")
            .get(url.as_str())
            .cloned()
            .ok_or_else(|| FetchError::Status {
                url: url.to_string(),
                status: 404,
            })
    }
}

/// Solid-colour PNG.
pub fn png(width: u32, height: u32) -> Bytes {
    encode(RgbaImage::from_pixel(width, height, Rgba([200, 40, 40, 255])))
}

/// PNG of pseudo-random pixels; compresses poorly, so its size tracks its area.
pub fn noisy_png(width: u32, height: u32, seed: u32) -> Bytes {
    let mut state = seed.wrapping_mul(2_654_435_761) | 1;
    let image = RgbaImage::from_fn(width, height, |_, _| {
        state ^= state << 13;
        state ^= state >> 17;
        state ^= state << 5;
        let [a, b, c, _] = state.to_le_bytes();
        Rgba([a, b, c, 255])
    });
    encode(image)
}

fn encode(image: RgbaImage) -> Bytes {
    let mut out = Cursor::new(Vec::new());
    image
        .write_to(&mut out, ImageFormat::Png)
        .expect("encode png");
    Bytes::from(out.into_inner())
}
