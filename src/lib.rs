//! Caches for re-rendering streaming markdown cheaply.
//!
//! [`cache`] holds the attachment pool, measurement cache and image cache;
//! [`application::render`] builds render passes and the streaming coalescer on top of them.

pub mod application;
pub mod cache;
pub mod config;
pub mod infra;
pub mod util;
