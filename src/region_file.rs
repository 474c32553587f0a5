//! Region File Capability
//!
//! The region-file binary format lives outside this crate. This module defines
//! the capability the handle cache consumes ([`RegionFile`], [`RegionFileOpener`])
//! and an in-memory implementation used by tests and tooling.

use crate::{Result, StoreError};
use bytes::Bytes;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

/// Result of a task run against a region file.
pub type RegionTaskResult = Result<Option<Bytes>>;

/// Work submitted to a region file's own executor.
pub type RegionTask = Box<dyn FnOnce(&dyn RegionFile) -> RegionTaskResult + Send + 'static>;

/// Completion of a submitted [`RegionTask`]. A dropped sender means the region
/// file discarded the task.
pub type PendingRegionTask = oneshot::Receiver<RegionTaskResult>;

/// An open region file holding a 32x32 grid of compressed chunks.
///
/// Implementations serialize access to their own storage; the cache only
/// bounds how many of them are open.
pub trait RegionFile: Send + Sync {
    /// Compressed bytes of a chunk, or `None` if the chunk was never written.
    fn get_deflated_bytes(&self, chunk_x: i32, chunk_z: i32) -> Result<Option<Bytes>>;

    fn put_deflated_bytes(&self, chunk_x: i32, chunk_z: i32, data: &[u8]) -> Result<()>;

    /// Change in on-disk size since the last call.
    fn size_delta(&self) -> i64;

    /// Run `task` on the region file's executor.
    fn submit_task(&self, task: RegionTask) -> PendingRegionTask;

    fn close(&self) -> Result<()>;
}

/// Creates region files for the handle cache.
pub trait RegionFileOpener: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn RegionFile>>;
}

impl<F> RegionFileOpener for F
where
    F: Fn(&Path) -> Result<Box<dyn RegionFile>> + Send + Sync,
{
    fn open(&self, path: &Path) -> Result<Box<dyn RegionFile>> {
        self(path)
    }
}

/// Chunk data and bookkeeping for one in-memory region.
#[derive(Debug, Default)]
struct MemoryRegionState {
    chunks: Mutex<HashMap<(i32, i32), Bytes>>,
    size_delta: AtomicI64,
    close_count: AtomicUsize,
}

/// Region file kept entirely in memory. Data survives close and reopen through
/// the same [`MemoryRegionOpener`].
#[derive(Clone)]
pub struct MemoryRegionFile {
    path: PathBuf,
    state: Arc<MemoryRegionState>,
    fail_close: bool,
}

impl MemoryRegionFile {
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn chunks(&self) -> std::sync::MutexGuard<'_, HashMap<(i32, i32), Bytes>> {
        self.state.chunks.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl RegionFile for MemoryRegionFile {
    fn get_deflated_bytes(&self, chunk_x: i32, chunk_z: i32) -> Result<Option<Bytes>> {
        Ok(self.chunks().get(&(chunk_x, chunk_z)).cloned())
    }

    fn put_deflated_bytes(&self, chunk_x: i32, chunk_z: i32, data: &[u8]) -> Result<()> {
        let previous = self
            .chunks()
            .insert((chunk_x, chunk_z), Bytes::copy_from_slice(data));
        let delta = data.len() as i64 - previous.map(|b| b.len() as i64).unwrap_or(0);
        self.state.size_delta.fetch_add(delta, Ordering::Relaxed);
        Ok(())
    }

    fn size_delta(&self) -> i64 {
        self.state.size_delta.swap(0, Ordering::Relaxed)
    }

    fn submit_task(&self, task: RegionTask) -> PendingRegionTask {
        let (tx, rx) = oneshot::channel();
        let region = self.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn_blocking(move || {
                    let _ = tx.send(task(&region));
                });
            }
            Err(_) => {
                let _ = tx.send(task(&region));
            }
        }
        rx
    }

    fn close(&self) -> Result<()> {
        self.state.close_count.fetch_add(1, Ordering::SeqCst);
        debug!("Closed in-memory region: path={:?}", self.path);
        if self.fail_close {
            return Err(StoreError::IoError(format!(
                "Simulated close failure: path={:?}",
                self.path
            )));
        }
        Ok(())
    }
}

/// Opens [`MemoryRegionFile`]s, creating an empty marker file on disk so
/// existence checks behave as they would for real region files.
#[derive(Default)]
pub struct MemoryRegionOpener {
    regions: Mutex<HashMap<PathBuf, Arc<MemoryRegionState>>>,
    opened: Mutex<Vec<PathBuf>>,
    fail_close: bool,
}

impl MemoryRegionOpener {
    pub fn new() -> Self {
        Self::default()
    }

    /// An opener whose regions report an error from `close`.
    pub fn failing_close() -> Self {
        Self {
            fail_close: true,
            ..Self::default()
        }
    }

    /// Every path opened so far, in order.
    pub fn opened(&self) -> Vec<PathBuf> {
        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Number of times regions at `path` have been closed.
    pub fn close_count(&self, path: &Path) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path)
            .map(|state| state.close_count.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// Total closes across all regions.
    pub fn total_closes(&self) -> usize {
        self.regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|state| state.close_count.load(Ordering::SeqCst))
            .sum()
    }
}

impl RegionFileOpener for MemoryRegionOpener {
    fn open(&self, path: &Path) -> Result<Box<dyn RegionFile>> {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                StoreError::IoError(format!(
                    "Failed to create region file: path={:?}, error={}",
                    path, e
                ))
            })?;

        let state = self
            .regions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(path.to_path_buf())
            .or_default()
            .clone();

        self.opened
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(path.to_path_buf());

        Ok(Box::new(MemoryRegionFile {
            path: path.to_path_buf(),
            state,
            fail_close: self.fail_close,
        }))
    }
}
