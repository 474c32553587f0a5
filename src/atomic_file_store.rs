//! Atomic File Store
//!
//! Path-addressed byte storage with three guarantees:
//!
//! 1. Writes to the same path never overlap. The first writer registers an
//!    in-flight record; later writers wait for it to finish and then retry
//!    with their own payload.
//! 2. A read never observes a half-written file. While a write is in flight
//!    the pending bytes are served from memory, and on disk the target is
//!    replaced through `_new` / `_old` siblings.
//! 3. Recently read files are served from a small LRU cache whose entries
//!    expire after a fixed duration and are dropped whenever the path is written.
//!
//! # Write sequence
//!
//! | Step | Action |
//! |---|---|
//! | 1 | create parent directory |
//! | 2 | write bytes to `<name>_new` |
//! | 3 | if `<name>` exists, rename it to `<name>_old` |
//! | 4 | rename `<name>_new` to `<name>` |
//! | 5 | delete `<name>_old` |
//!
//! A crash leaves at worst a stray sibling, which
//! [`AtomicFileStore::recover_interrupted_write`] cleans up.

use crate::{Result, StoreError};
use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

/// Suffix of the sibling the new content is written to before it replaces the target.
pub const NEW_SUFFIX: &str = "_new";
/// Suffix the previous content is moved to while the target is replaced.
pub const OLD_SUFFIX: &str = "_old";

/// Configuration for the [`AtomicFileStore`] read cache
#[derive(Debug, Clone)]
pub struct AtomicFileStoreConfig {
    /// Maximum number of cached files
    pub max_cache_entries: usize,
    /// Age after which a cached file is re-read from disk
    pub cache_expiry: Duration,
}

impl Default for AtomicFileStoreConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: 100,
            cache_expiry: Duration::from_secs(30),
        }
    }
}

/// Counters for the file store
#[derive(Debug, Default)]
pub struct FileStoreMetrics {
    pub cache_hits: AtomicU64,
    pub cache_misses: AtomicU64,
    pub expired_entries: AtomicU64,
    pub evictions: AtomicU64,
    /// Reads answered from a write still in flight
    pub in_flight_reads: AtomicU64,
    pub writes_committed: AtomicU64,
    /// Times a writer had to wait for another write to the same path
    pub write_waits: AtomicU64,
}

impl FileStoreMetrics {
    pub fn snapshot(&self) -> FileStoreMetricsSnapshot {
        FileStoreMetricsSnapshot {
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            expired_entries: self.expired_entries.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            in_flight_reads: self.in_flight_reads.load(Ordering::Relaxed),
            writes_committed: self.writes_committed.load(Ordering::Relaxed),
            write_waits: self.write_waits.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStoreMetricsSnapshot {
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub expired_entries: u64,
    pub evictions: u64,
    pub in_flight_reads: u64,
    pub writes_committed: u64,
    pub write_waits: u64,
}

/// Bytes currently being persisted for one path.
struct InFlightWrite {
    bytes: Bytes,
    /// Fires (or closes) once the write releases the path
    done: broadcast::Sender<()>,
}

type InFlightMap = DashMap<PathBuf, InFlightWrite>;

/// A cached file and when it was read.
#[derive(Debug, Clone)]
struct CachedFileBytes {
    data: Bytes,
    captured_at: Instant,
}

/// LRU read cache with per-entry expiry.
struct ReadCache {
    entries: HashMap<PathBuf, CachedFileBytes>,
    lru_order: VecDeque<PathBuf>,
    max_entries: usize,
    expiry: Duration,
    /// Bumped on every invalidation. A disk read only populates the cache if
    /// no write committed while it ran.
    generation: u64,
}

impl ReadCache {
    fn new(max_entries: usize, expiry: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            lru_order: VecDeque::new(),
            max_entries: max_entries.max(1),
            expiry,
            generation: 0,
        }
    }

    fn get(&mut self, path: &Path, metrics: &FileStoreMetrics) -> Option<Bytes> {
        let expired = match self.entries.get(path) {
            None => return None,
            Some(entry) => entry.captured_at.elapsed() > self.expiry,
        };

        if expired {
            self.remove(path);
            metrics.expired_entries.fetch_add(1, Ordering::Relaxed);
            debug!("Read cache entry expired: path={:?}", path);
            return None;
        }

        self.touch(path);
        self.entries.get(path).map(|entry| entry.data.clone())
    }

    fn insert(&mut self, path: PathBuf, data: Bytes, metrics: &FileStoreMetrics) {
        self.remove(&path);

        while self.entries.len() >= self.max_entries {
            let Some(victim) = self.lru_order.pop_front() else {
                break;
            };
            self.entries.remove(&victim);
            metrics.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicted read cache entry: path={:?}", victim);
        }

        self.lru_order.push_back(path.clone());
        self.entries.insert(
            path,
            CachedFileBytes {
                data,
                captured_at: Instant::now(),
            },
        );
    }

    fn invalidate(&mut self, path: &Path) {
        self.generation = self.generation.wrapping_add(1);
        self.remove(path);
    }

    fn remove(&mut self, path: &Path) {
        if self.entries.remove(path).is_some() {
            if let Some(pos) = self.lru_order.iter().position(|p| p == path) {
                self.lru_order.remove(pos);
            }
        }
    }

    fn touch(&mut self, path: &Path) {
        if let Some(pos) = self.lru_order.iter().position(|p| p == path) {
            if let Some(key) = self.lru_order.remove(pos) {
                self.lru_order.push_back(key);
            }
        }
    }
}

/// What [`AtomicFileStore::recover_interrupted_write`] did for a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// No sibling files were present
    Nothing,
    /// Only stray siblings were removed; the target was already complete
    RemovedSiblings,
    /// The target was missing and the complete `_new` file was moved into place
    PromotedNew,
    /// The target was missing and the `_old` file was moved back
    RestoredOld,
}

/// Coalescing, crash-safe byte store with a write-through read cache.
pub struct AtomicFileStore {
    in_flight: Arc<InFlightMap>,
    read_cache: Arc<Mutex<ReadCache>>,
    metrics: Arc<FileStoreMetrics>,
    shutdown: watch::Sender<bool>,
}

impl AtomicFileStore {
    pub fn new(config: AtomicFileStoreConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            in_flight: Arc::new(DashMap::new()),
            read_cache: Arc::new(Mutex::new(ReadCache::new(
                config.max_cache_entries,
                config.cache_expiry,
            ))),
            metrics: Arc::new(FileStoreMetrics::default()),
            shutdown,
        }
    }

    /// Claim the in-flight slot for `path`.
    ///
    /// If another write to `path` is in flight, waits until it releases the
    /// slot and tries again with this caller's bytes. Waiters are not queued:
    /// whichever retries first after a release goes next.
    ///
    /// Fails with `Interrupted` if the store is shut down while waiting.
    pub async fn begin_write(
        &self,
        path: impl Into<PathBuf>,
        bytes: impl Into<Bytes>,
    ) -> Result<WriteTicket> {
        let path = path.into();
        let bytes = bytes.into();
        let mut shutdown_rx = self.shutdown.subscribe();

        loop {
            if *shutdown_rx.borrow() {
                return Err(interrupted(&path));
            }

            let mut done_rx = match self.in_flight.entry(path.clone()) {
                Entry::Vacant(vacant) => {
                    let (done, _) = broadcast::channel(1);
                    vacant.insert(InFlightWrite {
                        bytes: bytes.clone(),
                        done,
                    });
                    return Ok(WriteTicket {
                        path,
                        bytes,
                        in_flight: Arc::clone(&self.in_flight),
                        read_cache: Arc::clone(&self.read_cache),
                        metrics: Arc::clone(&self.metrics),
                        released: false,
                    });
                }
                Entry::Occupied(occupied) => occupied.get().done.subscribe(),
            };

            self.metrics.write_waits.fetch_add(1, Ordering::Relaxed);
            debug!("Write already in flight, waiting: path={:?}", path);

            // A message, a closed channel and a lag all mean the slot was released.
            tokio::select! {
                _ = done_rx.recv() => {}
                _ = shutdown_rx.wait_for(|stopped| *stopped) => {
                    return Err(interrupted(&path));
                }
            }
        }
    }

    /// Write `bytes` to `path`, waiting for any in-flight write to the same path first.
    pub async fn write(&self, path: impl Into<PathBuf>, bytes: impl Into<Bytes>) -> Result<()> {
        self.begin_write(path, bytes).await?.commit().await
    }

    /// Read the full content of `path`.
    ///
    /// Returns the pending bytes if a write is in flight, cached bytes if a
    /// fresh entry exists, an empty buffer if no file exists, and otherwise
    /// the file's content (which is then cached).
    pub async fn read(&self, path: impl AsRef<Path>) -> Result<Bytes> {
        self.read_with(path.as_ref(), |path| async move { read_if_file(&path).await })
            .await
    }

    /// Read loop with the disk access supplied by `read_disk`.
    async fn read_with<F, Fut>(&self, path: &Path, mut read_disk: F) -> Result<Bytes>
    where
        F: FnMut(PathBuf) -> Fut,
        Fut: std::future::Future<Output = Result<Option<Bytes>>>,
    {
        loop {
            if let Some(write) = self.in_flight.get(path) {
                self.metrics.in_flight_reads.fetch_add(1, Ordering::Relaxed);
                debug!("Serving read from in-flight write: path={:?}", path);
                return Ok(write.bytes.clone());
            }

            let generation = {
                let mut cache = self.lock_cache();
                if let Some(data) = cache.get(path, &self.metrics) {
                    self.metrics.cache_hits.fetch_add(1, Ordering::Relaxed);
                    return Ok(data);
                }
                self.metrics.cache_misses.fetch_add(1, Ordering::Relaxed);
                cache.generation
            };

            let data = match read_disk(path.to_path_buf()).await? {
                Some(data) => data,
                // Missing mid-swap means a write started or finished after the
                // in-flight check; start over to pick up its bytes
                None if self.write_raced(path, generation) => continue,
                None => return Ok(Bytes::new()),
            };

            let mut cache = self.lock_cache();
            if cache.generation == generation {
                cache.insert(path.to_path_buf(), data.clone(), &self.metrics);
            } else {
                debug!("Skipping cache fill, a write committed during read: path={:?}", path);
            }

            return Ok(data);
        }
    }

    fn write_raced(&self, path: &Path, generation: u64) -> bool {
        self.in_flight.contains_key(path) || self.lock_cache().generation != generation
    }

    /// Drop any cached content for `path`.
    pub fn invalidate(&self, path: impl AsRef<Path>) {
        self.lock_cache().invalidate(path.as_ref());
    }

    /// Whether a write to `path` currently holds the in-flight slot.
    pub fn is_write_in_flight(&self, path: impl AsRef<Path>) -> bool {
        self.in_flight.contains_key(path.as_ref())
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn cached_entry_count(&self) -> usize {
        self.lock_cache().entries.len()
    }

    pub fn metrics(&self) -> FileStoreMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Fail current and future waits in [`begin_write`](Self::begin_write) with `Interrupted`.
    pub fn shutdown(&self) {
        self.shutdown.send_replace(true);
        info!(
            "Atomic file store shut down: in_flight={}",
            self.in_flight.len()
        );
    }

    /// Repair the leftovers of a write that was interrupted by a crash.
    ///
    /// Refuses to run while a write to `path` is in flight in this process.
    pub async fn recover_interrupted_write(&self, path: impl AsRef<Path>) -> Result<RecoveryAction> {
        let path = path.as_ref();
        if self.in_flight.contains_key(path) {
            return Err(StoreError::LockError(format!(
                "Cannot recover while a write is in flight: path={:?}",
                path
            )));
        }

        let action = recover_siblings(path).await?;
        if action != RecoveryAction::Nothing {
            self.invalidate(path);
            info!("Recovered interrupted write: path={:?}, action={:?}", path, action);
        }
        Ok(action)
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, ReadCache> {
        self.read_cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for AtomicFileStore {
    fn default() -> Self {
        Self::new(AtomicFileStoreConfig::default())
    }
}

/// Exclusive right to write one path, returned by [`AtomicFileStore::begin_write`].
///
/// While the ticket lives, reads of the path return the ticket's bytes and
/// other writers wait. Dropping it without committing releases the path.
pub struct WriteTicket {
    path: PathBuf,
    bytes: Bytes,
    in_flight: Arc<InFlightMap>,
    read_cache: Arc<Mutex<ReadCache>>,
    metrics: Arc<FileStoreMetrics>,
    released: bool,
}

impl WriteTicket {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Persist the bytes, invalidate the read cache and release the path.
    pub async fn commit(mut self) -> Result<()> {
        let result = commit_write(&self.path, &self.bytes).await;

        if result.is_ok() {
            self.read_cache
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .invalidate(&self.path);
            self.metrics.writes_committed.fetch_add(1, Ordering::Relaxed);
            debug!(
                "Committed write: path={:?}, bytes={}",
                self.path,
                self.bytes.len()
            );
        } else if let Err(e) = &result {
            warn!("Write failed: path={:?}, error={}", self.path, e);
        }

        self.release();
        result
    }

    fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Some((_, write)) = self.in_flight.remove(&self.path) {
            // No receivers is fine
            let _ = write.done.send(());
        }
    }
}

impl Drop for WriteTicket {
    fn drop(&mut self) {
        if !self.released {
            debug!("Write ticket dropped without commit: path={:?}", self.path);
            self.release();
        }
    }
}

/// Durably replace `path` with `bytes` through the `_new` / `_old` siblings.
pub async fn commit_write(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error("create directory for", path, e))?;
        }
    }

    let new_path = sibling_path(path, NEW_SUFFIX)?;
    let old_path = sibling_path(path, OLD_SUFFIX)?;

    tokio::fs::write(&new_path, bytes)
        .await
        .map_err(|e| io_error("write temp file", &new_path, e))?;

    safe_replace_file(path, &new_path, &old_path).await
}

/// Move `path` aside, move `new_path` into place, then delete the old copy.
async fn safe_replace_file(path: &Path, new_path: &Path, old_path: &Path) -> Result<()> {
    if path_exists(path).await? {
        tokio::fs::rename(path, old_path)
            .await
            .map_err(|e| io_error("move aside", path, e))?;
    }

    tokio::fs::rename(new_path, path)
        .await
        .map_err(|e| io_error("move into place", new_path, e))?;

    if path_exists(old_path).await? {
        tokio::fs::remove_file(old_path)
            .await
            .map_err(|e| io_error("delete", old_path, e))?;
    }

    Ok(())
}

async fn recover_siblings(path: &Path) -> Result<RecoveryAction> {
    let new_path = sibling_path(path, NEW_SUFFIX)?;
    let old_path = sibling_path(path, OLD_SUFFIX)?;

    let target = path_exists(path).await?;
    let new = path_exists(&new_path).await?;
    let old = path_exists(&old_path).await?;

    if target {
        // Target is complete; anything beside it is debris from before or after the swap.
        if new {
            tokio::fs::remove_file(&new_path)
                .await
                .map_err(|e| io_error("delete", &new_path, e))?;
        }
        if old {
            tokio::fs::remove_file(&old_path)
                .await
                .map_err(|e| io_error("delete", &old_path, e))?;
        }
        return Ok(if new || old {
            RecoveryAction::RemovedSiblings
        } else {
            RecoveryAction::Nothing
        });
    }

    if old && new {
        // The target is only moved aside once `_new` is fully written.
        tokio::fs::rename(&new_path, path)
            .await
            .map_err(|e| io_error("move into place", &new_path, e))?;
        tokio::fs::remove_file(&old_path)
            .await
            .map_err(|e| io_error("delete", &old_path, e))?;
        return Ok(RecoveryAction::PromotedNew);
    }

    if old {
        tokio::fs::rename(&old_path, path)
            .await
            .map_err(|e| io_error("restore", &old_path, e))?;
        return Ok(RecoveryAction::RestoredOld);
    }

    if new {
        // First write of this path never completed; its content may be truncated.
        tokio::fs::remove_file(&new_path)
            .await
            .map_err(|e| io_error("delete", &new_path, e))?;
        return Ok(RecoveryAction::RemovedSiblings);
    }

    Ok(RecoveryAction::Nothing)
}

/// Full content of `path`, or `None` if it is missing or not a regular file.
async fn read_if_file(path: &Path) -> Result<Option<Bytes>> {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => {}
        Ok(_) => return Ok(None),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error("stat", path, e)),
    }

    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(Bytes::from(data))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(io_error("read", path, e)),
    }
}

/// `path` with `suffix` appended to its file name.
pub fn sibling_path(path: &Path, suffix: &str) -> Result<PathBuf> {
    let name = path.file_name().ok_or_else(|| {
        StoreError::IoError(format!("Path has no file name: path={:?}", path))
    })?;
    let mut sibling: OsString = name.to_os_string();
    sibling.push(suffix);
    Ok(path.with_file_name(sibling))
}

async fn path_exists(path: &Path) -> Result<bool> {
    tokio::fs::try_exists(path)
        .await
        .map_err(|e| io_error("check", path, e))
}

fn io_error(action: &str, path: &Path, err: std::io::Error) -> StoreError {
    let message = format!("Failed to {} file: path={:?}, error={}", action, path, err);
    match err.kind() {
        std::io::ErrorKind::Interrupted => StoreError::Interrupted(message),
        _ => StoreError::IoError(message),
    }
}

fn interrupted(path: &Path) -> StoreError {
    StoreError::Interrupted(format!(
        "Interrupted while waiting for file write: path={:?}",
        path
    ))
}
