//! Logging Module
//!
//! Installs the application's tracing subscriber: a compact console layer and,
//! when a log directory is configured, a daily rolling file layer.

use crate::config::LoggingConfig;
use crate::{Result, StoreError};
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Base name of the rolling log files; the appender adds a date suffix.
pub const LOG_FILE_PREFIX: &str = "region-store.log";

/// Logger manager for the application's tracing setup
pub struct LoggerManager {
    pub config: LoggingConfig,
    initialized: bool,
}

impl LoggerManager {
    pub fn new(config: LoggingConfig) -> Self {
        Self {
            config,
            initialized: false,
        }
    }

    /// Whether this manager installed the global subscriber. False if another
    /// subscriber was already set.
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Directory log files are written to, if file logging is on
    pub fn log_dir(&self) -> Option<&Path> {
        self.config.log_dir.as_deref()
    }

    /// Initialize the logging system
    pub fn initialize(&mut self) -> Result<()> {
        let file_layer = match &self.config.log_dir {
            Some(dir) => {
                std::fs::create_dir_all(dir).map_err(|e| {
                    StoreError::IoError(format!(
                        "Failed to create log directory {:?}: {}",
                        dir, e
                    ))
                })?;

                let file_appender =
                    RollingFileAppender::new(Rotation::DAILY, dir.clone(), LOG_FILE_PREFIX);

                Some(
                    tracing_subscriber::fmt::layer()
                        .with_writer(file_appender)
                        .with_ansi(false)
                        .with_target(true)
                        .with_thread_ids(true)
                        .with_file(true)
                        .with_line_number(true)
                        .with_level(true)
                        .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                        .compact(),
                )
            }
            None => None,
        };

        // stdout carries command output, so the console layer writes to stderr
        let console_layer = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(true)
            .with_target(false)
            .with_level(true)
            .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
            .compact();

        // Use config log_level, but allow RUST_LOG env var to override
        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(&self.config.log_level));

        let result = tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .try_init();

        match result {
            Ok(_) => {
                self.initialized = true;
                info!("Logging initialized: level={}", self.config.log_level);
                if let Some(dir) = &self.config.log_dir {
                    info!("Application logs will be written to: {:?}", dir);
                }
            }
            Err(_) => {
                // Already initialized, likely in tests
                debug!("Tracing subscriber already initialized, skipping");
            }
        }

        Ok(())
    }

    /// Log files currently present in the log directory, oldest name first.
    pub fn log_files(&self) -> Result<Vec<PathBuf>> {
        let Some(dir) = &self.config.log_dir else {
            return Ok(Vec::new());
        };

        let entries = std::fs::read_dir(dir).map_err(|e| {
            StoreError::IoError(format!("Failed to read log directory {:?}: {}", dir, e))
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.path())
            .filter(|path| {
                path.file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.starts_with(LOG_FILE_PREFIX))
            })
            .collect();
        files.sort();
        Ok(files)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_initialize_creates_log_dir() {
        let dir = TempDir::new().unwrap();
        let log_dir = dir.path().join("logs/app");

        let mut manager = LoggerManager::new(LoggingConfig {
            log_level: "debug".to_string(),
            log_dir: Some(log_dir.clone()),
        });
        manager.initialize().unwrap();

        assert!(log_dir.is_dir());
        assert_eq!(manager.log_dir(), Some(log_dir.as_path()));
    }

    #[test]
    fn test_repeated_initialize_is_tolerated() {
        let mut first = LoggerManager::new(LoggingConfig::default());
        let mut second = LoggerManager::new(LoggingConfig::default());
        first.initialize().unwrap();
        second.initialize().unwrap();
        // At most one of them owns the global subscriber
        assert!(!(first.is_initialized() && second.is_initialized()));
    }

    #[test]
    fn test_log_files_without_dir() {
        let manager = LoggerManager::new(LoggingConfig::default());
        assert!(manager.log_files().unwrap().is_empty());
    }

    #[test]
    fn test_log_files_filters_by_prefix() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("region-store.log.2026-01-02"), b"").unwrap();
        std::fs::write(dir.path().join("region-store.log.2026-01-01"), b"").unwrap();
        std::fs::write(dir.path().join("other.txt"), b"").unwrap();

        let manager = LoggerManager::new(LoggingConfig {
            log_level: "info".to_string(),
            log_dir: Some(dir.path().to_path_buf()),
        });

        let files = manager.log_files().unwrap();
        assert_eq!(files.len(), 2);
        assert!(files[0].ends_with("region-store.log.2026-01-01"));
    }
}
