//! Region Store - concurrent storage access for chunk/region world data
//!
//! This library provides the building blocks a world server uses to read and
//! write chunk data safely from many tasks at once: striped mutex tables,
//! crash-safe whole-file writes with a read cache, a bounded cache of open
//! region files, and advisory per-chunk locks with timeout.

pub mod atomic_file_store;
pub mod chunk_key;
pub mod chunk_lock_manager;
pub mod chunk_store;
pub mod config;
pub mod error;
pub mod logging;
pub mod region_cache;
pub mod region_file;
pub mod striped_lock;

pub use error::{Result, StoreError};
