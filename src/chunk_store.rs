//! Chunk Store
//!
//! Owns one instance of each storage component and exposes chunk-level and
//! path-level operations on top of them:
//!
//! - compressed chunk bytes through the region handle cache, sync and async
//! - advisory chunk locks through the distributed lock manager
//! - whole-file reads and writes through the atomic file store
//!
//! Async chunk operations hold the chunk's stripe for their whole duration and
//! wait out any distributed lock on the chunk before touching the region file.

use crate::atomic_file_store::{AtomicFileStore, FileStoreMetricsSnapshot, RecoveryAction};
use crate::chunk_key::ChunkKey;
use crate::chunk_lock_manager::{
    ChunkLock, DistributedChunkLockManager, LockManagerMetricsSnapshot, LockResolution,
};
use crate::config::Config;
use crate::region_cache::{RegionCacheMetricsSnapshot, RegionHandle, RegionHandleCache};
use crate::region_file::{RegionFile, RegionFileOpener, RegionTask};
use crate::striped_lock::StripedLock;
use crate::{Result, StoreError};
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

/// A handle evicted between lookup and use is looked up again, up to this many times.
const MAX_REGION_ATTEMPTS: usize = 8;

/// Snapshot of every component's counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkStoreMetrics {
    pub files: FileStoreMetricsSnapshot,
    pub regions: RegionCacheMetricsSnapshot,
    pub locks: LockManagerMetricsSnapshot,
}

/// Chunk and file storage for one process.
pub struct ChunkStore {
    chunk_locks: StripedLock,
    entity_locks: StripedLock,
    files: AtomicFileStore,
    regions: RegionHandleCache,
    lock_manager: DistributedChunkLockManager,
}

impl ChunkStore {
    /// Build every component from `config`. Fails fast on invalid settings.
    /// Must be called from within a tokio runtime.
    pub fn new(config: &Config, opener: Arc<dyn RegionFileOpener>) -> Result<Self> {
        config.validate()?;

        let store = Self {
            chunk_locks: StripedLock::new("chunk", config.locks.chunk_stripes)?,
            entity_locks: StripedLock::new("entities", config.locks.entity_stripes)?,
            files: AtomicFileStore::new(config.file_store.to_store_config()),
            regions: RegionHandleCache::new(config.region_cache.max_open_regions, opener)?,
            lock_manager: DistributedChunkLockManager::new(config.locks.to_lock_manager_config())?,
        };

        info!(
            "Chunk store ready: chunk_stripes={}, entity_stripes={}, max_open_regions={}",
            config.locks.chunk_stripes,
            config.locks.entity_stripes,
            config.region_cache.max_open_regions
        );
        Ok(store)
    }

    /// Stripe table guarding chunk access.
    pub fn chunk_locks(&self) -> &StripedLock {
        &self.chunk_locks
    }

    /// Stripe table guarding entity containers.
    pub fn entity_locks(&self) -> &StripedLock {
        &self.entity_locks
    }

    pub fn files(&self) -> &AtomicFileStore {
        &self.files
    }

    pub fn regions(&self) -> &RegionHandleCache {
        &self.regions
    }

    pub fn lock_manager(&self) -> &DistributedChunkLockManager {
        &self.lock_manager
    }

    // Chunk bytes

    /// Compressed bytes of a chunk, read on the calling thread. `None` if the
    /// region file or the chunk does not exist.
    pub fn get_chunk_deflated(&self, region_dir: &Path, key: &ChunkKey) -> Result<Option<Bytes>> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let Some(handle) = self.regions.get_if_exists(region_dir, key.x(), key.z())? else {
                return Ok(None);
            };
            match handle.get_deflated_bytes(key.x(), key.z()) {
                Err(StoreError::RegionClosed(_)) if attempts < MAX_REGION_ATTEMPTS => {}
                other => return other,
            }
        }
    }

    /// Store compressed bytes for a chunk on the calling thread, creating the
    /// region file if needed.
    pub fn put_chunk_deflated(&self, region_dir: &Path, key: &ChunkKey, data: &[u8]) -> Result<()> {
        let mut attempts = 0;
        loop {
            attempts += 1;
            let handle = self.regions.get(region_dir, key.x(), key.z())?;
            match handle.put_deflated_bytes(key.x(), key.z(), data) {
                Err(StoreError::RegionClosed(_)) if attempts < MAX_REGION_ATTEMPTS => {}
                other => return other,
            }
        }
    }

    /// Async form of [`get_chunk_deflated`](Self::get_chunk_deflated), run on
    /// the region file's executor.
    pub async fn get_chunk_deflated_async(
        &self,
        region_dir: &Path,
        key: &ChunkKey,
    ) -> Result<Option<Bytes>> {
        let _stripe = self.chunk_locks.lock(key).await;
        self.await_unlock(key).await;

        let (x, z) = (key.x(), key.z());
        let mut attempts = 0;
        loop {
            attempts += 1;
            let Some(handle) = self.regions.get_if_exists(region_dir, x, z)? else {
                return Ok(None);
            };
            let task: RegionTask =
                Box::new(move |region: &dyn RegionFile| region.get_deflated_bytes(x, z));
            match run_region_task(&handle, x, z, "read", task).await {
                Err(StoreError::RegionClosed(_)) if attempts < MAX_REGION_ATTEMPTS => {}
                other => return other,
            }
        }
    }

    /// Async form of [`put_chunk_deflated`](Self::put_chunk_deflated).
    pub async fn put_chunk_deflated_async(
        &self,
        region_dir: &Path,
        key: &ChunkKey,
        data: Bytes,
    ) -> Result<()> {
        let _stripe = self.chunk_locks.lock(key).await;
        self.await_unlock(key).await;

        let (x, z) = (key.x(), key.z());
        let mut attempts = 0;
        loop {
            attempts += 1;
            let handle = self.regions.get(region_dir, x, z)?;
            let payload = data.clone();
            let task: RegionTask = Box::new(move |region: &dyn RegionFile| {
                region.put_deflated_bytes(x, z, &payload).map(|_| None)
            });
            match run_region_task(&handle, x, z, "write", task).await {
                Err(StoreError::RegionClosed(_)) if attempts < MAX_REGION_ATTEMPTS => {}
                other => return other.map(|_| ()),
            }
        }
    }

    /// Size change of the region file holding the chunk since the last call.
    pub fn size_delta(&self, region_dir: &Path, chunk_x: i32, chunk_z: i32) -> Result<i64> {
        self.regions.size_delta(region_dir, chunk_x, chunk_z)
    }

    /// Whether the region file holding the chunk is currently open.
    pub fn is_region_open(&self, region_dir: &Path, chunk_x: i32, chunk_z: i32) -> bool {
        self.regions.get_if_open(region_dir, chunk_x, chunk_z)
    }

    // Distributed chunk locks

    pub fn lock_until_write(&self, key: ChunkKey) -> Arc<ChunkLock> {
        self.lock_manager.lock_until_write(key)
    }

    pub fn written_chunk(&self, key: &ChunkKey) {
        self.lock_manager.written_chunk(key)
    }

    pub fn wait_for_lock(&self, key: &ChunkKey, on_released: impl FnOnce() + Send + 'static) {
        self.lock_manager.wait_for_lock(key, on_released)
    }

    pub async fn wait_for_unlock(&self, key: &ChunkKey) -> LockResolution {
        self.lock_manager.wait_for_unlock(key).await
    }

    // Files

    pub async fn read_file(&self, path: impl AsRef<Path>) -> Result<Bytes> {
        self.files.read(path).await
    }

    pub async fn write_file(&self, path: impl Into<PathBuf>, bytes: impl Into<Bytes>) -> Result<()> {
        self.files.write(path, bytes).await
    }

    pub async fn recover_file(&self, path: impl AsRef<Path>) -> Result<RecoveryAction> {
        self.files.recover_interrupted_write(path).await
    }

    pub fn metrics(&self) -> ChunkStoreMetrics {
        ChunkStoreMetrics {
            files: self.files.metrics(),
            regions: self.regions.metrics(),
            locks: self.lock_manager.metrics(),
        }
    }

    /// Stop the lock sweep, interrupt waiting writers and close every region file.
    pub fn shutdown(&self) {
        self.lock_manager.shutdown();
        self.files.shutdown();
        let closed = self.regions.close_all();
        info!("Chunk store shut down: regions_closed={}", closed);
    }

    async fn await_unlock(&self, key: &ChunkKey) {
        let resolution = self.lock_manager.wait_for_unlock(key).await;
        if resolution != LockResolution::NotLocked {
            debug!("Chunk lock cleared: key={}, resolution={:?}", key, resolution);
        }
    }
}

/// Submit `task` to the handle's executor and tag any failure with the chunk.
async fn run_region_task(
    handle: &RegionHandle,
    chunk_x: i32,
    chunk_z: i32,
    action: &str,
    task: RegionTask,
) -> Result<Option<Bytes>> {
    match handle.submit_task(task).await {
        Ok(Ok(data)) => Ok(data),
        Ok(Err(e)) => Err(handle.tag_error(chunk_x, chunk_z, action, e)),
        Err(_) => {
            error!(
                "Region task dropped before completion: path={:?}, chunk={},{}",
                handle.path(),
                chunk_x,
                chunk_z
            );
            Err(StoreError::InternalError(format!(
                "Region task dropped: path={:?}",
                handle.path()
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::region_file::MemoryRegionOpener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tempfile::TempDir;

    fn store_with(config: Config) -> (ChunkStore, Arc<MemoryRegionOpener>) {
        let opener = Arc::new(MemoryRegionOpener::new());
        let store = ChunkStore::new(&config, opener.clone()).unwrap();
        (store, opener)
    }

    fn store() -> (ChunkStore, Arc<MemoryRegionOpener>) {
        store_with(Config::default())
    }

    #[tokio::test]
    async fn test_invalid_config_fails_fast() {
        let mut config = Config::default();
        config.locks.chunk_stripes = 12;
        let opener = Arc::new(MemoryRegionOpener::new());
        assert!(matches!(
            ChunkStore::new(&config, opener),
            Err(StoreError::ConfigError(_))
        ));
    }

    #[tokio::test]
    async fn test_independent_stripe_tables() {
        let mut config = Config::default();
        config.locks.chunk_stripes = 128;
        config.locks.entity_stripes = 16;
        let (store, _) = store_with(config);

        assert_eq!(store.chunk_locks().stripe_count(), 128);
        assert_eq!(store.entity_locks().stripe_count(), 16);
        assert_eq!(store.chunk_locks().name(), "chunk");
        assert_eq!(store.entity_locks().name(), "entities");
    }

    #[tokio::test]
    async fn test_sync_get_missing_region_returns_none() {
        let dir = TempDir::new().unwrap();
        let (store, opener) = store();
        let key = ChunkKey::new("world", 0, 0);

        assert_eq!(store.get_chunk_deflated(dir.path(), &key).unwrap(), None);
        assert!(opener.opened().is_empty());
        assert!(!store.is_region_open(dir.path(), 0, 0));
    }

    #[tokio::test]
    async fn test_sync_put_then_get() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store();
        let key = ChunkKey::new("world", 40, -3);

        store.put_chunk_deflated(dir.path(), &key, b"deflated").unwrap();

        assert!(store.is_region_open(dir.path(), 40, -3));
        assert_eq!(
            store.get_chunk_deflated(dir.path(), &key).unwrap(),
            Some(Bytes::from_static(b"deflated"))
        );
        assert_eq!(store.size_delta(dir.path(), 40, -3).unwrap(), 8);
        assert_eq!(store.size_delta(dir.path(), 40, -3).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_async_put_then_get() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store();
        let key = ChunkKey::new("world", 1, 2);

        store
            .put_chunk_deflated_async(dir.path(), &key, Bytes::from_static(b"async"))
            .await
            .unwrap();
        assert_eq!(
            store.get_chunk_deflated_async(dir.path(), &key).await.unwrap(),
            Some(Bytes::from_static(b"async"))
        );
        assert_eq!(
            store
                .get_chunk_deflated_async(dir.path(), &ChunkKey::new("world", 3, 3))
                .await
                .unwrap(),
            None
        );
    }

    #[tokio::test]
    async fn test_get_after_handle_closed_reopens() {
        let dir = TempDir::new().unwrap();
        let (store, opener) = store();
        let key = ChunkKey::new("world", 5, 5);
        store.put_chunk_deflated(dir.path(), &key, b"kept").unwrap();

        store.regions().get(dir.path(), 5, 5).unwrap().close().unwrap();

        assert_eq!(
            store.get_chunk_deflated(dir.path(), &key).unwrap(),
            Some(Bytes::from_static(b"kept"))
        );
        assert_eq!(opener.opened().len(), 2);
    }

    #[tokio::test]
    async fn test_async_put_waits_for_distributed_lock() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store();
        let store = Arc::new(store);
        let key = ChunkKey::new("world", 0, 0);

        store.lock_until_write(key.clone());

        let writer = {
            let store = store.clone();
            let key = key.clone();
            let dir = dir.path().to_path_buf();
            tokio::spawn(async move {
                store
                    .put_chunk_deflated_async(&dir, &key, Bytes::from_static(b"local"))
                    .await
            })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!writer.is_finished());
        assert!(!store.is_region_open(dir.path(), 0, 0));

        store.written_chunk(&key);
        writer.await.unwrap().unwrap();
        assert_eq!(
            store.get_chunk_deflated(dir.path(), &key).unwrap(),
            Some(Bytes::from_static(b"local"))
        );
    }

    #[tokio::test]
    async fn test_lock_passthrough() {
        let (store, _) = store();
        let key = ChunkKey::new("world", 0, 0);
        let fired = Arc::new(AtomicUsize::new(0));

        store.lock_until_write(key.clone());
        let counter = fired.clone();
        store.wait_for_lock(&key, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        store.written_chunk(&key);

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.wait_for_unlock(&key).await, LockResolution::NotLocked);
        assert_eq!(store.metrics().locks.releases, 1);
    }

    #[tokio::test]
    async fn test_file_passthrough() {
        let dir = TempDir::new().unwrap();
        let (store, _) = store();
        let path = dir.path().join("data/level.dat");

        assert!(store.read_file(&path).await.unwrap().is_empty());
        store.write_file(path.clone(), &b"level"[..]).await.unwrap();
        assert_eq!(store.read_file(&path).await.unwrap(), Bytes::from_static(b"level"));
        assert_eq!(store.recover_file(&path).await.unwrap(), RecoveryAction::Nothing);
        assert_eq!(store.metrics().files.writes_committed, 1);
    }

    #[tokio::test]
    async fn test_shutdown_closes_regions_and_interrupts_writers() {
        let dir = TempDir::new().unwrap();
        let (store, opener) = store();
        let path = dir.path().join("players.dat");

        store
            .put_chunk_deflated(dir.path(), &ChunkKey::new("world", 0, 0), b"x")
            .unwrap();
        let ticket = store.files().begin_write(path.clone(), &b"first"[..]).await.unwrap();

        store.shutdown();

        assert_eq!(opener.total_closes(), 1);
        assert!(store.regions().is_empty());
        let err = store.write_file(path, &b"second"[..]).await.unwrap_err();
        assert!(err.is_interrupted());
        assert!(err.is_io());
        drop(ticket);
    }
}
