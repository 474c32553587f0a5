//! Error Module
//!
//! Defines error types and result types used throughout the region store.

use thiserror::Error;

/// Main error type for the region store
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("IO error: {0}")]
    IoError(String),

    /// A wait was cut short before the operation could run. Classified as an
    /// I/O error by [`StoreError::is_io`].
    #[error("Interrupted: {0}")]
    Interrupted(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Region error at chunk {x},{z} in {path}: {message}")]
    RegionError {
        path: String,
        x: i32,
        z: i32,
        message: String,
    },

    /// The region handle was closed between lookup and use.
    #[error("Region closed: {0}")]
    RegionClosed(String),

    #[error("Lock error: {0}")]
    LockError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl StoreError {
    /// True for disk failures and interrupted waits.
    pub fn is_io(&self) -> bool {
        matches!(self, StoreError::IoError(_) | StoreError::Interrupted(_))
    }

    /// True if this error came from a wait that was interrupted.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, StoreError::Interrupted(_))
    }

    /// Tag a region capability failure with the chunk it happened on.
    pub fn region(path: impl Into<String>, x: i32, z: i32, message: impl Into<String>) -> Self {
        StoreError::RegionError {
            path: path.into(),
            x,
            z,
            message: message.into(),
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::Interrupted => StoreError::Interrupted(err.to_string()),
            _ => StoreError::IoError(err.to_string()),
        }
    }
}

impl From<serde_yaml::Error> for StoreError {
    fn from(err: serde_yaml::Error) -> Self {
        StoreError::SerializationError(err.to_string())
    }
}

/// Result type alias for the region store
pub type Result<T> = std::result::Result<T, StoreError>;
