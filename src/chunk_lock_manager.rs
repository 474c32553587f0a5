//! Distributed Chunk Lock Manager
//!
//! Advisory per-chunk locks used to defer local work on a chunk while another
//! node owns it. Each lock moves through `locked -> (released | timed out)`
//! exactly once. Continuations registered with [`DistributedChunkLockManager::wait_for_lock`]
//! run exactly once when that happens.
//!
//! A background sweep periodically drops entries that are already resolved or
//! older than twice the default timeout. Locks normally leave the map on
//! release or timeout; the sweep only catches leaks.

use crate::chunk_key::ChunkKey;
use crate::{Result, StoreError};
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default time a chunk stays locked without an explicit release.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);
/// Default interval between leak sweeps.
pub const DEFAULT_CLEANUP_INTERVAL: Duration = Duration::from_secs(60);
/// Upper bound accepted for the default timeout and the cleanup interval.
pub const MAX_LOCK_DURATION: Duration = Duration::from_secs(24 * 60 * 60);

/// Configuration for the chunk lock manager
#[derive(Debug, Clone)]
pub struct ChunkLockManagerConfig {
    pub default_timeout: Duration,
    pub cleanup_interval: Duration,
}

impl Default for ChunkLockManagerConfig {
    fn default() -> Self {
        Self {
            default_timeout: DEFAULT_LOCK_TIMEOUT,
            cleanup_interval: DEFAULT_CLEANUP_INTERVAL,
        }
    }
}

/// How a chunk lock ended, as seen by a waiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResolution {
    /// `written_chunk` was called
    Released,
    /// The deadline passed first
    TimedOut,
    /// No lock was active when the wait started
    NotLocked,
}

type ReleaseCallback = Box<dyn FnOnce() + Send + 'static>;

#[derive(Default)]
struct LockState {
    resolution: Option<LockResolution>,
    callbacks: Vec<ReleaseCallback>,
}

/// One advisory lock on a chunk. Replacing the map entry does not affect an
/// existing `ChunkLock`; it still resolves on its own release or deadline.
pub struct ChunkLock {
    key: ChunkKey,
    created_at: Instant,
    timeout: Duration,
    state: Mutex<LockState>,
    resolved: watch::Sender<Option<LockResolution>>,
}

impl ChunkLock {
    fn new(key: ChunkKey, timeout: Duration) -> Self {
        let (resolved, _) = watch::channel(None);
        Self {
            key,
            created_at: Instant::now(),
            timeout,
            state: Mutex::new(LockState::default()),
            resolved,
        }
    }

    pub fn key(&self) -> &ChunkKey {
        &self.key
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn resolution(&self) -> Option<LockResolution> {
        self.lock_state().resolution
    }

    pub fn is_resolved(&self) -> bool {
        self.resolution().is_some()
    }

    /// Run `callback` once this lock resolves, or right away if it already has.
    pub fn on_resolved(&self, callback: impl FnOnce() + Send + 'static) {
        let mut state = self.lock_state();
        if state.resolution.is_some() {
            drop(state);
            callback();
            return;
        }
        state.callbacks.push(Box::new(callback));
    }

    /// Wait until this lock resolves.
    pub async fn wait(&self) -> LockResolution {
        let mut rx = self.resolved.subscribe();
        let result = match rx.wait_for(Option::is_some).await {
            Ok(resolution) => *resolution,
            // The sender lives as long as `self`
            Err(_) => None,
        };
        result.unwrap_or(LockResolution::Released)
    }

    /// Move to the resolved state. Returns false if already resolved, in which
    /// case nothing runs.
    fn resolve(&self, resolution: LockResolution) -> bool {
        let callbacks = {
            let mut state = self.lock_state();
            if state.resolution.is_some() {
                return false;
            }
            state.resolution = Some(resolution);
            std::mem::take(&mut state.callbacks)
        };

        self.resolved.send_replace(Some(resolution));

        debug!(
            "Chunk lock resolved: key={}, resolution={:?}, waiters={}, held_for={:?}",
            self.key,
            resolution,
            callbacks.len(),
            self.age()
        );

        for callback in callbacks {
            callback();
        }
        true
    }

    fn lock_state(&self) -> MutexGuard<'_, LockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl std::fmt::Debug for ChunkLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkLock")
            .field("key", &self.key)
            .field("timeout", &self.timeout)
            .field("resolution", &self.resolution())
            .finish()
    }
}

/// Counters for the lock manager
#[derive(Debug, Default)]
pub struct LockManagerMetrics {
    pub timeouts: AtomicU64,
    pub releases: AtomicU64,
    pub swept: AtomicU64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockManagerMetricsSnapshot {
    pub active_locks: usize,
    pub timeouts: u64,
    pub releases: u64,
    pub swept: u64,
}

/// State shared with the timer and sweep tasks.
struct LockTable {
    locks: DashMap<ChunkKey, Arc<ChunkLock>>,
    metrics: LockManagerMetrics,
    default_timeout: Duration,
}

impl LockTable {
    /// Drop entries that are resolved or older than twice the default timeout.
    fn sweep(&self) -> usize {
        let max_age = self.default_timeout.saturating_mul(2);
        let mut removed = 0usize;
        self.locks.retain(|_, lock| {
            let stale = lock.is_resolved() || lock.age() > max_age;
            if stale {
                removed += 1;
            }
            !stale
        });

        if removed > 0 {
            self.metrics
                .swept
                .fetch_add(removed as u64, Ordering::Relaxed);
            info!(
                "Swept stale chunk locks: removed={}, active={}",
                removed,
                self.locks.len()
            );
        }
        removed
    }

    /// Remove `lock` from the map only if it is still the current entry.
    fn remove_exact(&self, lock: &Arc<ChunkLock>) {
        self.locks
            .remove_if(lock.key(), |_, current| Arc::ptr_eq(current, lock));
    }
}

/// Per-chunk advisory locks with timeout and explicit release.
pub struct DistributedChunkLockManager {
    table: Arc<LockTable>,
    runtime: Handle,
    sweep_task: Mutex<Option<JoinHandle<()>>>,
}

impl DistributedChunkLockManager {
    /// Create the manager and start its sweep task. Must be called from within
    /// a tokio runtime; timers run on that runtime.
    pub fn new(config: ChunkLockManagerConfig) -> Result<Self> {
        if config.default_timeout.is_zero() || config.cleanup_interval.is_zero() {
            return Err(StoreError::ConfigError(format!(
                "Chunk lock timeout and cleanup interval must be positive: timeout={:?}, cleanup_interval={:?}",
                config.default_timeout, config.cleanup_interval
            )));
        }
        if config.default_timeout > MAX_LOCK_DURATION || config.cleanup_interval > MAX_LOCK_DURATION {
            return Err(StoreError::ConfigError(format!(
                "Chunk lock timeout and cleanup interval must not exceed {:?}: timeout={:?}, cleanup_interval={:?}",
                MAX_LOCK_DURATION, config.default_timeout, config.cleanup_interval
            )));
        }

        let runtime = Handle::try_current().map_err(|e| {
            StoreError::InternalError(format!(
                "Chunk lock manager requires a tokio runtime: {}",
                e
            ))
        })?;

        let table = Arc::new(LockTable {
            locks: DashMap::new(),
            metrics: LockManagerMetrics::default(),
            default_timeout: config.default_timeout,
        });

        let sweep_task =
            Self::start_sweep_task(&runtime, Arc::downgrade(&table), config.cleanup_interval);

        info!(
            "Chunk lock manager started: timeout={:?}, cleanup_interval={:?}",
            config.default_timeout, config.cleanup_interval
        );

        Ok(Self {
            table,
            runtime,
            sweep_task: Mutex::new(Some(sweep_task)),
        })
    }

    pub fn default_timeout(&self) -> Duration {
        self.table.default_timeout
    }

    /// Lock `key` with the default timeout, replacing any current lock.
    pub fn lock_until_write(&self, key: ChunkKey) -> Arc<ChunkLock> {
        self.lock_until_write_with_timeout(key, self.table.default_timeout)
    }

    /// Lock `key` until `written_chunk` or until `timeout` elapses.
    pub fn lock_until_write_with_timeout(&self, key: ChunkKey, timeout: Duration) -> Arc<ChunkLock> {
        let lock = Arc::new(ChunkLock::new(key.clone(), timeout));

        if let Some(previous) = self.table.locks.insert(key.clone(), Arc::clone(&lock)) {
            debug!(
                "Replaced chunk lock: key={}, previous_resolved={}",
                key,
                previous.is_resolved()
            );
        } else {
            debug!("Locked chunk until write: key={}, timeout={:?}", key, timeout);
        }

        self.start_timeout_task(Arc::clone(&lock));
        lock
    }

    /// Release the current lock on `key`. No-op if the chunk is not locked.
    pub fn written_chunk(&self, key: &ChunkKey) {
        if let Some((_, lock)) = self.table.locks.remove(key) {
            if lock.resolve(LockResolution::Released) {
                self.table.metrics.releases.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    /// Run `on_released` once the current lock on `key` resolves. Runs it
    /// synchronously, before returning, if the chunk is not locked.
    pub fn wait_for_lock(&self, key: &ChunkKey, on_released: impl FnOnce() + Send + 'static) {
        match self.current(key) {
            Some(lock) => lock.on_resolved(on_released),
            None => on_released(),
        }
    }

    /// Wait for the current lock on `key` to resolve.
    pub async fn wait_for_unlock(&self, key: &ChunkKey) -> LockResolution {
        match self.current(key) {
            Some(lock) => lock.wait().await,
            None => LockResolution::NotLocked,
        }
    }

    pub fn is_locked(&self, key: &ChunkKey) -> bool {
        self.current(key).is_some_and(|lock| !lock.is_resolved())
    }

    pub fn active_locks(&self) -> usize {
        self.table.locks.len()
    }

    pub fn timeouts_count(&self) -> u64 {
        self.table.metrics.timeouts.load(Ordering::Relaxed)
    }

    pub fn metrics(&self) -> LockManagerMetricsSnapshot {
        LockManagerMetricsSnapshot {
            active_locks: self.table.locks.len(),
            timeouts: self.table.metrics.timeouts.load(Ordering::Relaxed),
            releases: self.table.metrics.releases.load(Ordering::Relaxed),
            swept: self.table.metrics.swept.load(Ordering::Relaxed),
        }
    }

    /// Run one sweep now. Returns how many entries were dropped.
    pub fn sweep(&self) -> usize {
        self.table.sweep()
    }

    /// Stop the sweep task. Outstanding locks still resolve on their deadlines.
    pub fn shutdown(&self) {
        let task = self
            .sweep_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
            info!(
                "Chunk lock manager stopped: active_locks={}",
                self.table.locks.len()
            );
        }
    }

    /// Clone of the current map entry, without holding the map shard lock.
    fn current(&self, key: &ChunkKey) -> Option<Arc<ChunkLock>> {
        self.table.locks.get(key).map(|entry| Arc::clone(entry.value()))
    }

    fn start_timeout_task(&self, lock: Arc<ChunkLock>) {
        let table = Arc::downgrade(&self.table);
        self.runtime.spawn(async move {
            let mut resolved = lock.resolved.subscribe();
            tokio::select! {
                _ = tokio::time::sleep(lock.timeout) => {}
                _ = resolved.wait_for(Option::is_some) => return,
            }

            if !lock.resolve(LockResolution::TimedOut) {
                return;
            }
            warn!(
                "Chunk lock timed out: key={}, timeout={:?}",
                lock.key, lock.timeout
            );
            if let Some(table) = table.upgrade() {
                table.metrics.timeouts.fetch_add(1, Ordering::Relaxed);
                table.remove_exact(&lock);
            }
        });
    }

    fn start_sweep_task(
        runtime: &Handle,
        table: Weak<LockTable>,
        cleanup_interval: Duration,
    ) -> JoinHandle<()> {
        runtime.spawn(async move {
            let now = Instant::now();
            let start = now.checked_add(cleanup_interval).unwrap_or(now);
            let mut interval = tokio::time::interval_at(start, cleanup_interval);

            loop {
                interval.tick().await;

                let Some(table) = table.upgrade() else {
                    break;
                };
                table.sweep();
            }
        })
    }
}

impl Drop for DistributedChunkLockManager {
    fn drop(&mut self) {
        if let Some(task) = self
            .sweep_task
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
    }
}
