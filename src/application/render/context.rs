//! Per-surface render context.
//!
//! A [`RenderContext`] bundles the caches one rendering surface needs: its own attachment pool
//! and measurement cache, plus an image cache usually shared across surfaces. A [`RenderPass`]
//! drives one re-render: views mounted by the previous pass go back to the pool when it begins,
//! and every block then asks the pool before building a new view.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

use crate::cache::{
    AttachmentPool, ContentKey, ImageCache, MeasureConfig, MeasurementCache, PoolConfig,
    PooledView,
};

/// A view currently placed in the rendered output.
pub struct MountedView {
    pub key: ContentKey,
    pub view: Box<dyn PooledView>,
}

/// How [`RenderPass::acquire`] obtained a view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reuse {
    /// Same content as before; no rebuild or relayout needed.
    Exact,
    /// Same type, different content; must be reconfigured.
    Fallback,
    /// Newly built.
    Created,
}

/// Outcome counts of one render pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub recycled: usize,
    pub exact: usize,
    pub fallback: usize,
    pub created: usize,
}

/// Caches owned by one rendering surface.
pub struct RenderContext {
    pool: AttachmentPool,
    measurements: MeasurementCache,
    images: Arc<ImageCache>,
    last_pass_streaming: AtomicBool,
}

impl RenderContext {
    pub fn new(pool: &PoolConfig, measure: &MeasureConfig, images: Arc<ImageCache>) -> Self {
        Self::from_parts(AttachmentPool::new(pool), MeasurementCache::new(measure), images)
    }

    pub fn from_parts(
        pool: AttachmentPool,
        measurements: MeasurementCache,
        images: Arc<ImageCache>,
    ) -> Self {
        Self {
            pool,
            measurements,
            images,
            last_pass_streaming: AtomicBool::new(false),
        }
    }

    pub fn pool(&self) -> &AttachmentPool {
        &self.pool
    }

    pub fn measurements(&self) -> &MeasurementCache {
        &self.measurements
    }

    pub fn images(&self) -> &Arc<ImageCache> {
        &self.images
    }

    /// Start a pass, returning the previous pass's views to the pool.
    ///
    /// Only the trailing view of a streaming pass goes to the streaming slot; it is the one still
    /// growing, so its exact key will not recur. Everything else is parked under its content key.
    pub fn begin_pass(&self, previous: Vec<MountedView>, streaming: bool) -> RenderPass<'_> {
        let previous_streaming = self.last_pass_streaming.swap(streaming, Ordering::AcqRel);
        let recycled = previous.len();
        if recycled > 0 {
            self.pool.log_stats("before recycle");
        }

        let last = recycled.saturating_sub(1);
        for (index, mounted) in previous.into_iter().enumerate() {
            let trailing = previous_streaming && index == last;
            self.pool.recycle(mounted.view, mounted.key, trailing);
        }

        if recycled > 0 {
            self.pool.log_stats("after recycle");
        }

        RenderPass {
            context: self,
            streaming,
            mounted: Vec::new(),
            summary: PassSummary {
                recycled,
                ..PassSummary::default()
            },
        }
    }

    /// Forward a memory warning to every cache this surface uses.
    pub fn on_memory_pressure(&self) {
        self.pool.on_memory_pressure();
        self.measurements.on_memory_pressure();
        self.images.on_memory_pressure();
    }

    /// Drop pooled views and measurements. The shared image cache is left alone.
    pub fn clear(&self) {
        self.pool.clear();
        self.measurements.clear();
    }

    pub fn log_stats(&self, context: &str) {
        self.pool.log_stats(context);
        self.measurements.log_stats(context);
        self.images.log_stats(context);
    }
}

/// One re-render of a surface.
pub struct RenderPass<'a> {
    context: &'a RenderContext,
    streaming: bool,
    mounted: Vec<MountedView>,
    summary: PassSummary,
}

impl<'a> RenderPass<'a> {
    pub fn context(&self) -> &'a RenderContext {
        self.context
    }

    pub fn is_streaming(&self) -> bool {
        self.streaming
    }

    /// Reuse a pooled view for `key` or build one with `build`.
    pub fn acquire<T: PooledView>(
        &mut self,
        key: &ContentKey,
        build: impl FnOnce() -> T,
    ) -> (Box<T>, Reuse) {
        match self.context.pool.dequeue::<T>(key, self.streaming) {
            Some((view, true)) => {
                self.summary.exact += 1;
                (view, Reuse::Exact)
            }
            Some((view, false)) => {
                self.summary.fallback += 1;
                (view, Reuse::Fallback)
            }
            None => {
                self.summary.created += 1;
                (Box::new(build()), Reuse::Created)
            }
        }
    }

    /// Place a view in the output; it is recycled when the next pass begins.
    pub fn mount(&mut self, key: ContentKey, view: Box<dyn PooledView>) {
        self.mounted.push(MountedView { key, view });
    }

    /// Finish the pass, handing back the mounted views for the next one.
    pub fn finish(self) -> (Vec<MountedView>, PassSummary) {
        let summary = self.summary;
        debug!(
            op = "render::pass",
            streaming = self.streaming,
            mounted = self.mounted.len(),
            recycled = summary.recycled,
            exact = summary.exact,
            fallback = summary.fallback,
            created = summary.created,
            "Render pass finished"
        );
        self.context.pool.log_stats("after render");
        (self.mounted, summary)
    }
}

#[cfg(test)]
mod tests {
    use std::any::Any;
    use std::time::Duration;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tempfile::TempDir;
    use url::Url;

    use super::*;
    use crate::cache::{FetchError, ImageCacheConfig, ImageFetcher};

    struct Offline;

    #[async_trait]
    impl ImageFetcher for Offline {
        async fn fetch(&self, url: &Url) -> Result<Bytes, FetchError> {
            Err(FetchError::Status {
                url: url.to_string(),
                status: 503,
            })
        }
    }

    struct Code {
        id: u32,
        resets: u32,
    }

    impl PooledView for Code {
        fn prepare_for_reuse(&mut self) {
            self.resets += 1;
        }

        fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
            self
        }
    }

    async fn context(dir: &TempDir) -> RenderContext {
        let images = ImageCache::open(
            ImageCacheConfig {
                disk_cache_directory: dir.path().to_path_buf(),
                ..ImageCacheConfig::default()
            },
            Arc::new(Offline),
        )
        .await
        .expect("image cache");
        let pool = PoolConfig {
            capacity: Some(16),
            ttl: Duration::from_secs(30),
        };
        RenderContext::new(&pool, &MeasureConfig::default(), Arc::new(images))
    }

    fn key(n: u32) -> ContentKey {
        ContentKey::code_block(&"x".repeat(n as usize), None, false, 300.0, false)
    }

    fn render(pass: &mut RenderPass<'_>, keys: &[u32]) -> Vec<Reuse> {
        let mut reuses = Vec::new();
        for &n in keys {
            let key = key(n);
            let (view, reuse) = pass.acquire(&key, || Code { id: n, resets: 0 });
            reuses.push(reuse);
            pass.mount(key, view);
        }
        reuses
    }

    #[tokio::test]
    async fn second_pass_reuses_every_unchanged_view() {
        let dir = TempDir::new().expect("tempdir");
        let context = context(&dir).await;

        let mut pass = context.begin_pass(Vec::new(), false);
        assert_eq!(render(&mut pass, &[1, 2, 3]), vec![Reuse::Created; 3]);
        let (mounted, _) = pass.finish();

        let mut pass = context.begin_pass(mounted, false);
        assert_eq!(render(&mut pass, &[1, 2, 3]), vec![Reuse::Exact; 3]);
        let (mounted, summary) = pass.finish();

        assert_eq!(mounted.len(), 3);
        assert_eq!(summary.recycled, 3);
        assert_eq!(summary.exact, 3);
        assert!(context.pool().is_empty());
    }

    #[tokio::test]
    async fn growing_trailing_block_reuses_streaming_view() {
        let dir = TempDir::new().expect("tempdir");
        let context = context(&dir).await;

        let mut pass = context.begin_pass(Vec::new(), true);
        render(&mut pass, &[1, 2]);
        let (mounted, _) = pass.finish();

        let mut pass = context.begin_pass(mounted, true);
        let (view, reuse) = pass.acquire::<Code>(&key(1), || Code { id: 99, resets: 0 });
        assert_eq!(reuse, Reuse::Exact);
        assert_eq!(view.id, 1);

        let (view, reuse) = pass.acquire::<Code>(&key(3), || Code { id: 99, resets: 0 });
        assert_eq!(reuse, Reuse::Fallback);
        assert_eq!(view.id, 2);
        assert_eq!(view.resets, 1);
    }

    #[tokio::test]
    async fn views_left_unclaimed_stay_pooled() {
        let dir = TempDir::new().expect("tempdir");
        let context = context(&dir).await;

        let mut pass = context.begin_pass(Vec::new(), false);
        render(&mut pass, &[1, 2]);
        let (mounted, _) = pass.finish();

        let mut pass = context.begin_pass(mounted, false);
        render(&mut pass, &[1]);
        pass.finish();

        assert_eq!(context.pool().len(), 1);
        context.on_memory_pressure();
        assert!(context.pool().is_empty());
    }
}
