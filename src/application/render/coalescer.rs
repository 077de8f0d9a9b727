//! Throttling of re-render requests during streaming.
//!
//! Content mutations can arrive once per token. The coalescer collapses every burst into at most
//! one render per interval, always with the most recent content, and renders whatever is still
//! pending immediately when the stream ends.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use metrics::counter;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::cache::lock::mutex_lock;

const SOURCE: &str = "application::render::coalescer";
const DEFAULT_THROTTLE_INTERVAL_MS: u64 = 100;

const METRIC_RENDER_COALESCED: &str = "mdcache_render_coalesced_total";
const METRIC_RENDER: &str = "mdcache_render_total";

/// Coalescer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoalescerConfig {
    pub throttle_interval: Duration,
}

impl Default for CoalescerConfig {
    fn default() -> Self {
        Self {
            throttle_interval: Duration::from_millis(DEFAULT_THROTTLE_INTERVAL_MS),
        }
    }
}

impl From<&crate::config::StreamingSettings> for CoalescerConfig {
    fn from(settings: &crate::config::StreamingSettings) -> Self {
        Self {
            throttle_interval: settings.throttle_interval,
        }
    }
}

struct CoalescerState<T> {
    pending: Option<T>,
    timer: Option<JoinHandle<()>>,
    // Bumped whenever a timer is armed or disarmed; a firing timer with an old epoch does nothing.
    epoch: u64,
    // Order in which snapshots left the pending slot.
    issued: u64,
}

struct Inner<T> {
    state: Mutex<CoalescerState<T>>,
    rendered: Mutex<u64>,
    render: Box<dyn Fn(T) + Send + Sync>,
}

impl<T> Inner<T> {
    fn fire(&self, epoch: u64) {
        let taken = {
            let mut state = mutex_lock(&self.state, SOURCE, "fire");
            if state.epoch != epoch {
                return;
            }
            state.timer = None;
            let pending = state.pending.take();
            pending.map(|content| {
                state.issued += 1;
                (state.issued, content)
            })
        };

        if let Some((seq, content)) = taken {
            self.render_ordered(seq, content, "timer");
        }
    }

    /// Run the render callback unless a newer snapshot already rendered.
    fn render_ordered(&self, seq: u64, content: T, trigger: &'static str) {
        let mut rendered = mutex_lock(&self.rendered, SOURCE, "render");
        if seq <= *rendered {
            debug!(
                op = "coalescer::render",
                result = "superseded",
                trigger,
                "Skipped render overtaken by a newer snapshot"
            );
            return;
        }
        *rendered = seq;
        counter!(METRIC_RENDER, "trigger" => trigger).increment(1);
        (self.render)(content);
    }
}

/// Collapses bursts of `notify` calls into single renders.
///
/// Renders never run concurrently and never go backwards: a snapshot is only rendered if no newer
/// one has rendered already. The render callback must not call back into its own coalescer.
pub struct RenderCoalescer<T: Send + 'static> {
    inner: Arc<Inner<T>>,
    interval: Duration,
    runtime: Handle,
}

impl<T: Send + 'static> RenderCoalescer<T> {
    /// Create a coalescer whose timers run on the current tokio runtime.
    ///
    /// Panics when called outside a runtime, like [`Handle::current`].
    pub fn new(config: CoalescerConfig, render: impl Fn(T) + Send + Sync + 'static) -> Self {
        Self::with_handle(config, Handle::current(), render)
    }

    pub fn with_handle(
        config: CoalescerConfig,
        runtime: Handle,
        render: impl Fn(T) + Send + Sync + 'static,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(CoalescerState {
                    pending: None,
                    timer: None,
                    epoch: 0,
                    issued: 0,
                }),
                rendered: Mutex::new(0),
                render: Box::new(render),
            }),
            interval: config.throttle_interval,
            runtime,
        }
    }

    /// Record new content. Arms the timer when idle; otherwise just replaces the snapshot.
    pub fn notify(&self, content: T) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "notify");
        if state.pending.replace(content).is_some() {
            counter!(METRIC_RENDER_COALESCED).increment(1);
        }
        if state.timer.is_some() {
            return;
        }

        state.epoch += 1;
        let epoch = state.epoch;
        let inner = Arc::clone(&self.inner);
        let interval = self.interval;
        state.timer = Some(self.runtime.spawn(async move {
            tokio::time::sleep(interval).await;
            inner.fire(epoch);
        }));
    }

    /// Cancel the timer and render pending content now, on the calling thread.
    ///
    /// Returns whether anything was rendered.
    pub fn flush(&self) -> bool {
        let taken = {
            let mut state = mutex_lock(&self.inner.state, SOURCE, "flush");
            if let Some(timer) = state.timer.take() {
                timer.abort();
            }
            state.epoch += 1;
            let pending = state.pending.take();
            pending.map(|content| {
                state.issued += 1;
                (state.issued, content)
            })
        };

        match taken {
            Some((seq, content)) => {
                self.inner.render_ordered(seq, content, "flush");
                true
            }
            None => false,
        }
    }

    /// Drop pending content and the timer without rendering.
    pub fn cancel(&self) {
        let mut state = mutex_lock(&self.inner.state, SOURCE, "cancel");
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.epoch += 1;
        if state.pending.take().is_some() {
            debug!(
                op = "coalescer::cancel",
                "Discarded pending render"
            );
        }
    }

    /// Whether content is waiting for the timer.
    pub fn is_pending(&self) -> bool {
        mutex_lock(&self.inner.state, SOURCE, "is_pending")
            .pending
            .is_some()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl<T: Send + 'static> Drop for RenderCoalescer<T> {
    fn drop(&mut self) {
        self.cancel();
    }
}
