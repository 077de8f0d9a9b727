//! Application layer: render orchestration on top of the caches.

pub mod error;
pub mod render;
