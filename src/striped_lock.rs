//! Striped Lock Module
//!
//! A fixed table of independent mutexes. A key is mapped to one stripe with
//! `hash(key) & (stripes - 1)`, so operations on the same key serialize without
//! a single global lock. Two different keys may share a stripe; that only adds
//! spurious serialization.
//!
//! The stripe count is fixed at construction and must be a positive power of two.

use crate::{Result, StoreError};
use std::collections::hash_map::DefaultHasher;
use std::hash::{BuildHasher, BuildHasherDefault, Hash};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

/// Default stripe count for both the chunk and the entity tables.
pub const DEFAULT_STRIPE_COUNT: usize = 64;

/// Fixed-size table of mutexes selected by key hash.
pub struct StripedLock {
    /// Label used in logs ("chunk", "entities")
    name: &'static str,
    stripes: Box<[Mutex<()>]>,
    /// `stripes.len() - 1`
    mask: usize,
    /// Unkeyed hasher so stripe selection is stable for the process lifetime
    hasher: BuildHasherDefault<DefaultHasher>,
}

impl StripedLock {
    /// Create a stripe table. Fails with `ConfigError` unless `stripe_count`
    /// is a positive power of two.
    pub fn new(name: &'static str, stripe_count: usize) -> Result<Self> {
        validate_stripe_count(name, stripe_count)?;

        let stripes: Box<[Mutex<()>]> = (0..stripe_count).map(|_| Mutex::new(())).collect();

        debug!("Created striped lock: name={}, stripes={}", name, stripe_count);

        Ok(Self {
            name,
            stripes,
            mask: stripe_count - 1,
            hasher: BuildHasherDefault::default(),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn stripe_count(&self) -> usize {
        self.stripes.len()
    }

    /// Index of the stripe a precomputed hash maps to.
    pub fn stripe_for_hash(&self, hash: u64) -> usize {
        (hash as usize) & self.mask
    }

    /// Index of the stripe `key` maps to.
    pub fn stripe_index<K: Hash + ?Sized>(&self, key: &K) -> usize {
        self.stripe_for_hash(self.hasher.hash_one(key))
    }

    /// The mutex guarding `key`.
    pub fn lock_for<K: Hash + ?Sized>(&self, key: &K) -> &Mutex<()> {
        &self.stripes[self.stripe_index(key)]
    }

    /// Acquire the stripe for `key`, holding it until the guard drops.
    pub async fn lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.lock_for(key).lock().await
    }

    /// Acquire the stripe for `key` from synchronous code. Must not be called
    /// from within an async context.
    pub fn blocking_lock<K: Hash + ?Sized>(&self, key: &K) -> MutexGuard<'_, ()> {
        self.lock_for(key).blocking_lock()
    }
}

/// Reject stripe counts the hash-and-mask selection cannot use.
pub fn validate_stripe_count(name: &str, stripe_count: usize) -> Result<()> {
    if stripe_count == 0 || !stripe_count.is_power_of_two() {
        return Err(StoreError::ConfigError(format!(
            "Lock count must be a positive power of two: name={}, count={}",
            name, stripe_count
        )));
    }
    Ok(())
}
