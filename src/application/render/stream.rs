//! Replays a document as if it were arriving token by token.

use std::time::Duration;

use tracing::{debug, info};

use super::coalescer::RenderCoalescer;

const DEFAULT_TICK_MS: u64 = 50;
const MAX_CHUNK_CHARS: usize = 3;

/// Content handed to the coalescer by the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSnapshot {
    pub text: String,
    /// Set on the last snapshot of the stream.
    pub finished: bool,
}

/// Emits a text in one-to-three character chunks at a fixed cadence.
#[derive(Debug, Clone)]
pub struct StreamingSimulator {
    text: String,
    tick: Duration,
}

impl StreamingSimulator {
    pub fn new(text: impl Into<String>) -> Self {
        Self::with_tick(text, Duration::from_millis(DEFAULT_TICK_MS))
    }

    pub fn with_tick(text: impl Into<String>, tick: Duration) -> Self {
        Self {
            text: text.into(),
            tick,
        }
    }

    /// Prefixes of the text after each chunk, ending with the full text.
    ///
    /// Chunk sizes cycle through one, two and three characters and never split a character.
    pub fn prefixes(&self) -> Vec<&str> {
        if self.text.is_empty() {
            return Vec::new();
        }
        let boundaries: Vec<usize> = self
            .text
            .char_indices()
            .map(|(offset, _)| offset)
            .skip(1)
            .chain(std::iter::once(self.text.len()))
            .collect();

        let mut prefixes = Vec::new();
        let mut consumed = 0;
        let mut size = 1;
        while consumed < boundaries.len() {
            consumed = (consumed + size).min(boundaries.len());
            prefixes.push(&self.text[..boundaries[consumed - 1]]);
            size = size % MAX_CHUNK_CHARS + 1;
        }
        prefixes
    }

    /// Stream into `coalescer`, then mark the stream finished and flush.
    ///
    /// Returns the number of chunks emitted.
    pub async fn run(&self, coalescer: &RenderCoalescer<StreamSnapshot>) -> usize {
        let prefixes = self.prefixes();
        info!(
            op = "stream::run",
            chars = self.text.chars().count(),
            chunks = prefixes.len(),
            tick_ms = self.tick.as_millis() as u64,
            "Streaming started"
        );

        for prefix in &prefixes {
            tokio::time::sleep(self.tick).await;
            coalescer.notify(StreamSnapshot {
                text: (*prefix).to_string(),
                finished: false,
            });
        }

        coalescer.notify(StreamSnapshot {
            text: self.text.clone(),
            finished: true,
        });
        let flushed = coalescer.flush();
        debug!(op = "stream::run", flushed, "Streaming finished");
        prefixes.len()
    }
}
