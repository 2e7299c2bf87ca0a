use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::{OviError, Result};

/// How often a waiter re-checks the winner of an in-flight transfer.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Fixed conservative ceiling on concurrent layer tasks. Buffers are
/// bounded per task, so K times the chunk size stays within reason.
pub fn worker_count() -> usize {
    (num_cpus::get() * 2).clamp(4, 12)
}

/// Completed-bytes/files accounting shared across tasks; mutation is
/// atomic, snapshots are advisory.
#[derive(Debug, Default)]
pub struct TransferProgress {
    total_bytes: AtomicU64,
    completed_bytes: AtomicU64,
    total_files: AtomicU64,
    completed_files: AtomicU64,
}

impl TransferProgress {
    pub fn add_total(&self, bytes: u64, files: u64) {
        self.total_bytes.fetch_add(bytes, Ordering::Relaxed);
        self.total_files.fetch_add(files, Ordering::Relaxed);
    }

    pub fn add_completed_bytes(&self, bytes: u64) {
        self.completed_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn file_done(&self) {
        self.completed_files.fetch_add(1, Ordering::Relaxed);
    }

    /// (completed bytes, total bytes, completed files, total files)
    pub fn snapshot(&self) -> (u64, u64, u64, u64) {
        (
            self.completed_bytes.load(Ordering::Relaxed),
            self.total_bytes.load(Ordering::Relaxed),
            self.completed_files.load(Ordering::Relaxed),
            self.total_files.load(Ordering::Relaxed),
        )
    }
}

/// Digests currently in flight anywhere in the process. The first caller
/// for a digest becomes its transferrer; later callers wait on the result
/// instead of issuing a parallel request.
#[derive(Default)]
pub struct InflightSet {
    inner: Mutex<HashSet<String>>,
}

impl InflightSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True when the caller becomes the transferrer for `digest`.
    pub async fn begin(&self, digest: &str) -> bool {
        self.inner.lock().await.insert(digest.to_string())
    }

    pub async fn finish(&self, digest: &str) {
        self.inner.lock().await.remove(digest);
    }

    async fn contains(&self, digest: &str) -> bool {
        self.inner.lock().await.contains(digest)
    }

    /// Bounded poll for the winner's output file to land at `path`.
    pub async fn wait_for_file(&self, digest: &str, path: &Path, timeout: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            if path.is_file() {
                return Ok(());
            }
            if !self.contains(digest).await {
                // transferrer is done; one last look before giving up
                if path.is_file() {
                    return Ok(());
                }
                return Err(OviError::LayerDownloadFailed(digest.to_string()));
            }
            if started.elapsed() > timeout {
                return Err(OviError::LayerDownloadFailed(digest.to_string()));
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Bounded poll until `digest` is no longer in flight. Used on the
    /// push side, where the waiter re-probes the registry afterwards.
    pub async fn wait_until_done(&self, digest: &str, timeout: Duration) {
        let started = tokio::time::Instant::now();
        while self.contains(digest).await {
            if started.elapsed() > timeout {
                return;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Chunk outputs keyed by planned index. Tasks insert as they finish;
/// reassembly reads in index order, so completion order never matters.
#[derive(Default)]
pub struct PartsCollector {
    parts: Mutex<BTreeMap<usize, PathBuf>>,
}

impl PartsCollector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, index: usize, path: PathBuf) {
        self.parts.lock().await.insert(index, path);
    }

    pub async fn take(&self) -> BTreeMap<usize, PathBuf> {
        std::mem::take(&mut *self.parts.lock().await)
    }
}
