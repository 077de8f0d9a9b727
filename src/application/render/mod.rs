//! Render loop plumbing around the caches.
//!
//! The [`RenderCoalescer`] decides *when* to re-render; a [`RenderContext`] and its
//! [`RenderPass`] make each re-render cheap by reusing views and measurements from the previous
//! one. [`DocumentRenderer`] ties both to a document and [`StreamingSimulator`] replays a document
//! through them as if it were streaming in.

mod blocks;
mod coalescer;
mod context;
mod document;
mod stream;
mod views;

pub use blocks::{Block, scan_blocks};
pub use coalescer::{CoalescerConfig, RenderCoalescer};
pub use context::{MountedView, PassSummary, RenderContext, RenderPass, Reuse};
pub use document::{DocumentRenderer, RenderSummary};
pub use stream::{StreamSnapshot, StreamingSimulator};
pub use views::{CodeBlockView, ImageView, QuoteView, RuleView, TableView};
