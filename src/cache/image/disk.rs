//! On-disk tier holding raw encoded image bytes.
//!
//! Files are named by the SHA-256 of the source identifier. The set of files, their sizes and
//! their access order live in memory; the directory is scanned once when the tier opens and kept
//! in sync incrementally afterwards.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use bytes::Bytes;
use metrics::gauge;
use sha2::{Digest, Sha256};
use tokio::fs;
use tracing::{debug, info, warn};

use super::error::ImageCacheError;
use crate::cache::lock::mutex_lock;

const SOURCE: &str = "cache::image::disk";
const METRIC_DISK_BYTES: &str = "mdcache_image_disk_bytes";
const TEMP_PREFIX: &str = ".incoming-";

#[derive(Debug, Clone, Copy)]
struct DiskRecord {
    size: u64,
    last_access: SystemTime,
    seq: u64,
}

#[derive(Debug, Default)]
struct DiskState {
    records: HashMap<String, DiskRecord>,
    total_bytes: u64,
    seq: u64,
}

impl DiskState {
    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Remove least-recently-accessed records until the total fits `budget`.
    fn evict_to(&mut self, budget: u64) -> Vec<String> {
        let mut victims = Vec::new();
        while self.total_bytes > budget {
            let Some(oldest) = self
                .records
                .iter()
                .min_by_key(|(_, record)| record.seq)
                .map(|(key, _)| key.clone())
            else {
                self.total_bytes = 0;
                break;
            };
            if let Some(record) = self.records.remove(&oldest) {
                self.total_bytes = self.total_bytes.saturating_sub(record.size);
            }
            victims.push(oldest);
        }
        victims
    }
}

/// Filesystem-safe key for a source identifier.
pub(crate) fn disk_key(source: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hex::encode(hasher.finalize())
}

/// Byte-budgeted LRU directory of encoded images.
#[derive(Debug)]
pub(crate) struct DiskTier {
    dir: PathBuf,
    state: Mutex<DiskState>,
    budget_bytes: Mutex<u64>,
}

impl DiskTier {
    /// Create the directory if needed and index the files already in it.
    pub(crate) async fn open(dir: PathBuf, budget_bytes: u64) -> Result<Self, ImageCacheError> {
        let started = Instant::now();
        fs::create_dir_all(&dir).await?;

        let scan_dir = dir.clone();
        let mut found = tokio::task::spawn_blocking(move || scan(&scan_dir)).await??;
        found.sort_by(|a, b| a.2.cmp(&b.2).then_with(|| a.0.cmp(&b.0)));

        let mut state = DiskState::default();
        for (key, size, modified) in found {
            let seq = state.next_seq();
            state.total_bytes += size;
            state.records.insert(
                key,
                DiskRecord {
                    size,
                    last_access: modified,
                    seq,
                },
            );
        }

        info!(
            op = "image::disk::open",
            dir = %dir.display(),
            files = state.records.len(),
            total_bytes = state.total_bytes,
            budget_bytes,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Indexed image disk cache"
        );

        let victims = state.evict_to(budget_bytes);
        gauge!(METRIC_DISK_BYTES).set(state.total_bytes as f64);
        let tier = Self {
            dir,
            state: Mutex::new(state),
            budget_bytes: Mutex::new(budget_bytes),
        };
        tier.remove_files(victims).await;
        Ok(tier)
    }

    pub(crate) fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(key)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        mutex_lock(&self.state, SOURCE, "contains")
            .records
            .contains_key(key)
    }

    /// Read the stored bytes for `key`, refreshing its access time.
    pub(crate) async fn read(&self, key: &str) -> Option<Bytes> {
        if !self.contains(key) {
            return None;
        }

        let path = self.path_for(key);
        match fs::read(&path).await {
            Ok(data) => {
                self.touch(key).await;
                Some(Bytes::from(data))
            }
            Err(err) => {
                warn!(
                    op = "image::disk::read",
                    result = "read_error",
                    path = %path.display(),
                    error = %err,
                    "Indexed image file unreadable; dropping record"
                );
                self.forget(key);
                None
            }
        }
    }

    async fn touch(&self, key: &str) {
        let now = SystemTime::now();
        {
            let mut guard = mutex_lock(&self.state, SOURCE, "touch");
            let state = &mut *guard;
            let seq = state.next_seq();
            if let Some(record) = state.records.get_mut(key) {
                record.last_access = now;
                record.seq = seq;
            }
        }

        let path = self.path_for(key);
        let result = tokio::task::spawn_blocking(move || {
            std::fs::File::options()
                .write(true)
                .open(&path)
                .and_then(|file| file.set_modified(now))
        })
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                debug!(
                    op = "image::disk::touch",
                    result = "mtime_error",
                    error = %err,
                    "Failed to refresh image file modification time"
                );
            }
            Err(err) => {
                debug!(
                    op = "image::disk::touch",
                    result = "join_error",
                    error = %err,
                    "Touch task did not complete"
                );
            }
        }
    }

    /// Persist `data` under `key`, then evict down to the byte budget.
    pub(crate) async fn store(&self, key: &str, data: Bytes) -> Result<(), ImageCacheError> {
        let dir = self.dir.clone();
        let path = self.path_for(key);
        let size = data.len() as u64;

        tokio::task::spawn_blocking(move || -> Result<(), ImageCacheError> {
            let mut file = tempfile::Builder::new()
                .prefix(TEMP_PREFIX)
                .tempfile_in(&dir)?;
            file.write_all(&data)?;
            file.persist(&path).map_err(|err| err.error)?;
            Ok(())
        })
        .await??;

        let budget = *mutex_lock(&self.budget_bytes, SOURCE, "store.budget");
        let (victims, total) = {
            let mut guard = mutex_lock(&self.state, SOURCE, "store");
            let state = &mut *guard;
            let seq = state.next_seq();
            let previous = state.records.insert(
                key.to_string(),
                DiskRecord {
                    size,
                    last_access: SystemTime::now(),
                    seq,
                },
            );
            if let Some(previous) = previous {
                state.total_bytes = state.total_bytes.saturating_sub(previous.size);
            }
            state.total_bytes += size;
            (state.evict_to(budget), state.total_bytes)
        };

        gauge!(METRIC_DISK_BYTES).set(total as f64);
        debug!(
            op = "image::disk::store",
            size,
            total_bytes = total,
            evicted = victims.len(),
            "Persisted image bytes"
        );
        self.remove_files(victims).await;
        Ok(())
    }

    fn forget(&self, key: &str) {
        let mut state = mutex_lock(&self.state, SOURCE, "forget");
        if let Some(record) = state.records.remove(key) {
            state.total_bytes = state.total_bytes.saturating_sub(record.size);
            gauge!(METRIC_DISK_BYTES).set(state.total_bytes as f64);
        }
    }

    /// Drop a record whose bytes turned out to be unusable, along with its file.
    pub(crate) async fn discard(&self, key: &str) {
        self.forget(key);
        self.remove_files(vec![key.to_string()]).await;
    }

    async fn remove_files(&self, keys: Vec<String>) {
        for key in keys {
            let path = self.path_for(&key);
            if let Err(err) = fs::remove_file(&path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(
                        op = "image::disk::evict",
                        result = "remove_error",
                        path = %path.display(),
                        error = %err,
                        "Failed to remove evicted image file"
                    );
                }
            }
        }
    }

    pub(crate) async fn set_budget(&self, budget_bytes: u64) {
        *mutex_lock(&self.budget_bytes, SOURCE, "set_budget") = budget_bytes;
        let (victims, total) = {
            let mut state = mutex_lock(&self.state, SOURCE, "set_budget");
            let victims = state.evict_to(budget_bytes);
            (victims, state.total_bytes)
        };
        gauge!(METRIC_DISK_BYTES).set(total as f64);
        self.remove_files(victims).await;
    }

    /// Remove every cached file and reset the running total.
    pub(crate) async fn clear(&self) -> Result<(), ImageCacheError> {
        {
            let mut state = mutex_lock(&self.state, SOURCE, "clear");
            *state = DiskState::default();
        }
        gauge!(METRIC_DISK_BYTES).set(0.0);
        match fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    pub(crate) fn total_bytes(&self) -> u64 {
        mutex_lock(&self.state, SOURCE, "total_bytes").total_bytes
    }

    pub(crate) fn len(&self) -> usize {
        mutex_lock(&self.state, SOURCE, "len").records.len()
    }
}

fn scan(dir: &Path) -> Result<Vec<(String, u64, SystemTime)>, std::io::Error> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(err) => {
                debug!(
                    op = "image::disk::scan",
                    result = "skipped",
                    path = %entry.path().display(),
                    error = %err,
                    "Unreadable cache entry metadata"
                );
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }
        if name.starts_with(TEMP_PREFIX) {
            // Leftover from an interrupted write.
            if let Err(err) = std::fs::remove_file(entry.path()) {
                debug!(
                    op = "image::disk::scan",
                    result = "remove_error",
                    path = %entry.path().display(),
                    error = %err,
                    "Failed to remove leftover temp file"
                );
            }
            continue;
        }
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        found.push((name.to_string(), metadata.len(), modified));
    }
    Ok(found)
}
