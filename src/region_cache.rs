//! Region Handle Cache
//!
//! Bounded cache of open region files keyed by canonical path. At most one live
//! handle exists per path; every handle is closed exactly once, when it is
//! evicted, reclaimed or the cache is closed.
//!
//! Lookups share a read lock. Inserts, evictions and stale-entry removal take
//! the write lock, and only for the duration of the map update.
//!
//! A cached handle can go stale without being evicted: [`RegionHandleCache::reclaim_idle`]
//! closes handles nobody holds, and a caller may close a handle it found broken.
//! Lookups treat a closed handle exactly like a missing one, removing it under
//! the write lock before opening a fresh one.

use crate::chunk_key::region_file_name;
use crate::region_file::{PendingRegionTask, RegionFile, RegionFileOpener, RegionTask};
use crate::{Result, StoreError};
use bytes::Bytes;
use dashmap::DashMap;
use std::collections::{HashMap, VecDeque};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

/// Default maximum number of open region files.
pub const DEFAULT_MAX_OPEN_REGIONS: usize = 256;

/// Counters for the region handle cache
#[derive(Debug, Default)]
pub struct RegionCacheMetrics {
    pub opened: AtomicU64,
    pub evictions: AtomicU64,
    /// Closed handles found in the map and removed
    pub stale_removed: AtomicU64,
    pub close_failures: AtomicU64,
    /// Handles closed by `reclaim_idle`
    pub reclaimed: AtomicU64,
}

impl RegionCacheMetrics {
    pub fn snapshot(&self) -> RegionCacheMetricsSnapshot {
        RegionCacheMetricsSnapshot {
            opened: self.opened.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            stale_removed: self.stale_removed.load(Ordering::Relaxed),
            close_failures: self.close_failures.load(Ordering::Relaxed),
            reclaimed: self.reclaimed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegionCacheMetricsSnapshot {
    pub opened: u64,
    pub evictions: u64,
    pub stale_removed: u64,
    pub close_failures: u64,
    pub reclaimed: u64,
}

/// Shared handle to one open region file.
pub struct RegionHandle {
    path: PathBuf,
    file: Box<dyn RegionFile>,
    closed: AtomicBool,
}

impl RegionHandle {
    fn new(path: PathBuf, file: Box<dyn RegionFile>) -> Self {
        Self {
            path,
            file,
            closed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close the underlying region file. Only the first call reaches the file;
    /// later calls return `Ok(false)`.
    pub fn close(&self) -> Result<bool> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(false);
        }
        self.file.close()?;
        Ok(true)
    }

    pub fn get_deflated_bytes(&self, chunk_x: i32, chunk_z: i32) -> Result<Option<Bytes>> {
        self.ensure_open(chunk_x, chunk_z)?;
        self.file
            .get_deflated_bytes(chunk_x, chunk_z)
            .map_err(|e| self.tag_error(chunk_x, chunk_z, "read", e))
    }

    pub fn put_deflated_bytes(&self, chunk_x: i32, chunk_z: i32, data: &[u8]) -> Result<()> {
        self.ensure_open(chunk_x, chunk_z)?;
        self.file
            .put_deflated_bytes(chunk_x, chunk_z, data)
            .map_err(|e| self.tag_error(chunk_x, chunk_z, "write", e))
    }

    pub fn size_delta(&self) -> i64 {
        self.file.size_delta()
    }

    /// Hand `task` to the region file's own executor.
    pub fn submit_task(&self, task: RegionTask) -> PendingRegionTask {
        if self.is_closed() {
            let (tx, rx) = oneshot::channel();
            let _ = tx.send(Err(StoreError::RegionClosed(format!("{:?}", self.path))));
            return rx;
        }
        self.file.submit_task(task)
    }

    fn ensure_open(&self, chunk_x: i32, chunk_z: i32) -> Result<()> {
        if self.is_closed() {
            debug!(
                "Region handle already closed: path={:?}, chunk={},{}",
                self.path, chunk_x, chunk_z
            );
            return Err(StoreError::RegionClosed(format!("{:?}", self.path)));
        }
        Ok(())
    }

    pub(crate) fn tag_error(
        &self,
        chunk_x: i32,
        chunk_z: i32,
        action: &str,
        err: StoreError,
    ) -> StoreError {
        error!(
            "Error when trying to {} chunk {},{} in {:?}: {}",
            action, chunk_x, chunk_z, self.path, err
        );
        match err {
            tagged @ (StoreError::RegionError { .. } | StoreError::RegionClosed(_)) => tagged,
            other => StoreError::region(
                self.path.display().to_string(),
                chunk_x,
                chunk_z,
                other.to_string(),
            ),
        }
    }
}

impl std::fmt::Debug for RegionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegionHandle")
            .field("path", &self.path)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Map plus insertion order for eviction.
#[derive(Default)]
struct CacheState {
    handles: HashMap<PathBuf, Arc<RegionHandle>>,
    order: VecDeque<PathBuf>,
}

impl CacheState {
    fn remove(&mut self, path: &Path) -> Option<Arc<RegionHandle>> {
        let handle = self.handles.remove(path)?;
        if let Some(pos) = self.order.iter().position(|p| p == path) {
            self.order.remove(pos);
        }
        Some(handle)
    }

    /// Remove the entry for `path` only if it is closed.
    fn remove_if_stale(&mut self, path: &Path) -> bool {
        match self.handles.get(path) {
            Some(handle) if handle.is_closed() => {
                self.remove(path);
                true
            }
            _ => false,
        }
    }

    /// Oldest entry, removed from both structures.
    fn pop_oldest(&mut self) -> Option<(PathBuf, Arc<RegionHandle>)> {
        while let Some(path) = self.order.pop_front() {
            if let Some(handle) = self.handles.remove(&path) {
                return Some((path, handle));
            }
        }
        None
    }
}

/// Result of a read-locked lookup.
enum Lookup {
    Live(Arc<RegionHandle>),
    Stale,
    Missing,
}

/// Bounded cache of open region files.
pub struct RegionHandleCache {
    max_open: usize,
    opener: Arc<dyn RegionFileOpener>,
    /// Canonicalization of a given input path is stable for the process lifetime
    canonical_paths: DashMap<PathBuf, PathBuf>,
    state: RwLock<CacheState>,
    metrics: RegionCacheMetrics,
}

impl RegionHandleCache {
    pub fn new(max_open: usize, opener: Arc<dyn RegionFileOpener>) -> Result<Self> {
        if max_open == 0 {
            return Err(StoreError::ConfigError(
                "Region cache must allow at least one open region file".to_string(),
            ));
        }
        Ok(Self {
            max_open,
            opener,
            canonical_paths: DashMap::new(),
            state: RwLock::new(CacheState::default()),
            metrics: RegionCacheMetrics::default(),
        })
    }

    pub fn max_open(&self) -> usize {
        self.max_open
    }

    /// Number of cached entries, live or not yet cleaned up.
    pub fn len(&self) -> usize {
        self.read_state().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> RegionCacheMetricsSnapshot {
        self.metrics.snapshot()
    }

    /// True iff a live handle for the chunk's region is cached. Never opens one.
    pub fn get_if_open(&self, region_dir: &Path, chunk_x: i32, chunk_z: i32) -> bool {
        let path = self.canonical(&region_file_path(region_dir, chunk_x, chunk_z));
        matches!(self.lookup(&path), Lookup::Live(_))
    }

    /// The cached handle, or a newly opened one if the region file exists on
    /// disk. Returns `None` without creating anything if it does not.
    pub fn get_if_exists(
        &self,
        region_dir: &Path,
        chunk_x: i32,
        chunk_z: i32,
    ) -> Result<Option<Arc<RegionHandle>>> {
        let raw = region_file_path(region_dir, chunk_x, chunk_z);
        let path = self.canonical(&raw);

        match self.lookup(&path) {
            Lookup::Live(handle) => return Ok(Some(handle)),
            Lookup::Stale => self.remove_stale(&path),
            Lookup::Missing => {}
        }

        match std::fs::metadata(&path) {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(StoreError::IoError(format!(
                    "Failed to check region file: path={:?}, error={}",
                    path, e
                )))
            }
        }

        self.get(region_dir, chunk_x, chunk_z).map(Some)
    }

    /// The live handle for the chunk's region, opening it if necessary.
    pub fn get(&self, region_dir: &Path, chunk_x: i32, chunk_z: i32) -> Result<Arc<RegionHandle>> {
        let raw = region_file_path(region_dir, chunk_x, chunk_z);
        let path = self.canonical(&raw);

        if let Lookup::Live(handle) = self.lookup(&path) {
            return Ok(handle);
        }

        let mut state = self.write_state();

        // Another caller may have opened it while we waited for the write lock
        if let Some(handle) = state.handles.get(&path) {
            if !handle.is_closed() {
                return Ok(Arc::clone(handle));
            }
        }
        if state.remove_if_stale(&path) {
            self.metrics.stale_removed.fetch_add(1, Ordering::Relaxed);
            debug!("Removed stale region handle: path={:?}", path);
        }

        if !region_dir.exists() {
            std::fs::create_dir_all(region_dir).map_err(|e| {
                StoreError::IoError(format!(
                    "Failed to create region directory: path={:?}, error={}",
                    region_dir, e
                ))
            })?;
        }

        // The directory exists now, so canonicalization can resolve it
        let path = self.canonical(&raw);
        if let Some(handle) = state.handles.get(&path) {
            if !handle.is_closed() {
                return Ok(Arc::clone(handle));
            }
        }
        state.remove_if_stale(&path);

        // Open before evicting so a failed open leaves the cache untouched
        let file = self.opener.open(&path)?;
        if state.handles.len() >= self.max_open {
            self.evict_one(&mut state);
        }

        let handle = Arc::new(RegionHandle::new(path.clone(), file));
        state.handles.insert(path.clone(), Arc::clone(&handle));
        state.order.push_back(path.clone());
        self.metrics.opened.fetch_add(1, Ordering::Relaxed);

        debug!(
            "Opened region file: path={:?}, open={}/{}",
            path,
            state.handles.len(),
            self.max_open
        );
        Ok(handle)
    }

    /// Size change of the chunk's region file since the last call.
    pub fn size_delta(&self, region_dir: &Path, chunk_x: i32, chunk_z: i32) -> Result<i64> {
        Ok(self.get(region_dir, chunk_x, chunk_z)?.size_delta())
    }

    /// Close and drop every cached handle that no caller currently holds.
    /// Returns how many were reclaimed.
    pub fn reclaim_idle(&self) -> usize {
        let mut state = self.write_state();

        let idle: Vec<PathBuf> = state
            .handles
            .iter()
            .filter(|(_, handle)| Arc::strong_count(handle) == 1 || handle.is_closed())
            .map(|(path, _)| path.clone())
            .collect();

        let mut reclaimed = 0;
        for path in idle {
            if let Some(handle) = state.remove(&path) {
                self.close_quietly(&handle);
                reclaimed += 1;
            }
        }

        if reclaimed > 0 {
            self.metrics
                .reclaimed
                .fetch_add(reclaimed as u64, Ordering::Relaxed);
            info!(
                "Reclaimed idle region handles: reclaimed={}, remaining={}",
                reclaimed,
                state.handles.len()
            );
        }
        reclaimed
    }

    /// Close every cached handle and empty the cache.
    pub fn close_all(&self) -> usize {
        let mut state = self.write_state();
        let mut closed = 0;
        while let Some((_, handle)) = state.pop_oldest() {
            self.close_quietly(&handle);
            closed += 1;
        }
        info!("Closed all region handles: closed={}", closed);
        closed
    }

    fn lookup(&self, path: &Path) -> Lookup {
        let state = self.read_state();
        match state.handles.get(path) {
            Some(handle) if !handle.is_closed() => Lookup::Live(Arc::clone(handle)),
            Some(_) => Lookup::Stale,
            None => Lookup::Missing,
        }
    }

    fn remove_stale(&self, path: &Path) {
        if self.write_state().remove_if_stale(path) {
            self.metrics.stale_removed.fetch_add(1, Ordering::Relaxed);
            debug!("Removed stale region handle: path={:?}", path);
        }
    }

    /// Must be called with the write lock held.
    fn evict_one(&self, state: &mut CacheState) {
        if let Some((path, handle)) = state.pop_oldest() {
            self.metrics.evictions.fetch_add(1, Ordering::Relaxed);
            debug!("Evicting region handle: path={:?}", path);
            self.close_quietly(&handle);
        }
    }

    /// Close failures are logged; the entry is gone either way.
    fn close_quietly(&self, handle: &RegionHandle) {
        if let Err(e) = handle.close() {
            self.metrics.close_failures.fetch_add(1, Ordering::Relaxed);
            warn!(
                "Failed to close region file: path={:?}, error={}",
                handle.path(),
                e
            );
        }
    }

    fn canonical(&self, path: &Path) -> PathBuf {
        if let Some(cached) = self.canonical_paths.get(path) {
            return cached.clone();
        }

        match resolve_canonical(path) {
            Some(canonical) => {
                self.canonical_paths
                    .insert(path.to_path_buf(), canonical.clone());
                canonical
            }
            // Not cached: the directory may appear later and resolve differently
            None => normalize_lexically(path),
        }
    }

    fn read_state(&self) -> RwLockReadGuard<'_, CacheState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_state(&self) -> RwLockWriteGuard<'_, CacheState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for RegionHandleCache {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        for handle in state.handles.values() {
            if let Err(e) = handle.close() {
                warn!(
                    "Failed to close region file on drop: path={:?}, error={}",
                    handle.path(),
                    e
                );
            }
        }
    }
}

/// `<region_dir>/r.<chunk_x >> 5>.<chunk_z >> 5>.mca`
pub fn region_file_path(region_dir: &Path, chunk_x: i32, chunk_z: i32) -> PathBuf {
    region_dir.join(region_file_name(chunk_x, chunk_z))
}

/// Canonical form of `path`, resolving the parent directory if the file
/// itself does not exist yet.
fn resolve_canonical(path: &Path) -> Option<PathBuf> {
    if let Ok(canonical) = std::fs::canonicalize(path) {
        return Some(canonical);
    }
    let parent = path.parent()?;
    let name = path.file_name()?;
    std::fs::canonicalize(parent)
        .ok()
        .map(|dir| dir.join(name))
}

/// Absolute path with `.` and `..` removed, without touching the filesystem.
fn normalize_lexically(path: &Path) -> PathBuf {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        match std::env::current_dir() {
            Ok(cwd) => cwd.join(path),
            Err(_) => path.to_path_buf(),
        }
    };

    let mut normalized = PathBuf::new();
    for component in absolute.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    normalized
}
