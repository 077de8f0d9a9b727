//! Generation-guarded delivery target for asynchronous image loads.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::decode::DecodedImage;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "cache::image::slot";

/// Token identifying one load request against an [`ImageSlot`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotToken(u64);

/// Holds the image currently shown by a view.
///
/// A view that is recycled while a load is in flight calls [`ImageSlot::invalidate`] (or starts a
/// new load); the late result then carries an outdated token and is dropped instead of landing on
/// content it no longer belongs to.
#[derive(Debug, Default)]
pub struct ImageSlot {
    generation: AtomicU64,
    image: Mutex<Option<Arc<DecodedImage>>>,
}

impl ImageSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new load: clears the current image and returns the token results must carry.
    pub fn begin(&self) -> SlotToken {
        let generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        *mutex_lock(&self.image, SOURCE, "begin") = None;
        SlotToken(generation)
    }

    /// Store `image` if `token` is still the latest. Returns whether it was accepted.
    pub fn deliver(&self, token: SlotToken, image: Option<Arc<DecodedImage>>) -> bool {
        let mut current = mutex_lock(&self.image, SOURCE, "deliver");
        if self.generation.load(Ordering::Acquire) != token.0 {
            return false;
        }
        *current = image;
        true
    }

    /// Abandon any in-flight load and clear the image.
    pub fn invalidate(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
        *mutex_lock(&self.image, SOURCE, "invalidate") = None;
    }

    pub fn image(&self) -> Option<Arc<DecodedImage>> {
        mutex_lock(&self.image, SOURCE, "image").clone()
    }

    pub fn is_current(&self, token: SlotToken) -> bool {
        self.generation.load(Ordering::Acquire) == token.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::image::decode::{decode_downsampled, encode_png};

    fn image() -> Arc<DecodedImage> {
        Arc::new(decode_downsampled(&encode_png(2, 2), 10).expect("decode"))
    }

    #[test]
    fn latest_token_is_delivered() {
        let slot = ImageSlot::new();
        let token = slot.begin();
        assert!(slot.deliver(token, Some(image())));
        assert!(slot.image().is_some());
    }

    #[test]
    fn stale_token_is_rejected() {
        let slot = ImageSlot::new();
        let first = slot.begin();
        let second = slot.begin();
        assert!(!slot.deliver(first, Some(image())));
        assert!(slot.image().is_none());
        assert!(slot.is_current(second));
    }

    #[test]
    fn invalidate_drops_in_flight_result() {
        let slot = ImageSlot::new();
        let token = slot.begin();
        assert!(slot.deliver(token, Some(image())));
        slot.invalidate();
        assert!(slot.image().is_none());
        assert!(!slot.deliver(token, Some(image())));
    }
}
