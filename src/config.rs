//! Configuration Module
//!
//! Handles configuration loading from files, environment variables, and command-line arguments.
//! Values are layered in that order over the built-in defaults and validated once at the end.

use crate::atomic_file_store::AtomicFileStoreConfig;
use crate::chunk_lock_manager::{ChunkLockManagerConfig, MAX_LOCK_DURATION};
use crate::striped_lock::{validate_stripe_count, DEFAULT_STRIPE_COUNT};
use crate::{Result, StoreError};
use clap::{Arg, ArgMatches};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

/// Custom (de)serializer for Duration using string format like "30s", "5m", "500ms"
pub(crate) mod duration_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        parse_duration(&s).map_err(serde::de::Error::custom)
    }

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&format_duration(*duration))
    }

    pub(crate) fn parse_duration(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        if s.is_empty() {
            return Err("Empty duration string".to_string());
        }

        // Find where the number ends and the unit begins
        let mut num_end = 0;
        for (i, c) in s.chars().enumerate() {
            if c.is_ascii_digit() || c == '.' {
                num_end = i + 1;
            } else {
                break;
            }
        }

        if num_end == 0 {
            return Err(format!("No number found in duration string: {}", s));
        }

        let num_str = &s[..num_end];
        let unit = s[num_end..].trim();

        let value: f64 = num_str
            .parse()
            .map_err(|e| format!("Failed to parse number '{}': {}", num_str, e))?;

        let secs = match unit {
            "s" | "sec" | "secs" | "second" | "seconds" | "" => value,
            "m" | "min" | "mins" | "minute" | "minutes" => value * 60.0,
            "h" | "hr" | "hrs" | "hour" | "hours" => value * 3600.0,
            "ms" | "millis" | "millisecond" | "milliseconds" => value / 1000.0,
            _ => return Err(format!("Unknown duration unit: {}", unit)),
        };

        let duration = Duration::try_from_secs_f64(secs)
            .map_err(|e| format!("Duration '{}' out of range: {}", s, e))?;

        Ok(duration)
    }

    /// Whole seconds print as "30s", anything else as milliseconds.
    pub(crate) fn format_duration(duration: Duration) -> String {
        let millis = duration.as_millis();
        if millis % 1000 == 0 {
            format!("{}s", millis / 1000)
        } else {
            format!("{}ms", millis)
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub file_store: FileStoreConfig,
    #[serde(default)]
    pub region_cache: RegionCacheConfig,
    #[serde(default)]
    pub locks: LocksConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Read cache of the atomic file store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileStoreConfig {
    /// Maximum cached files (default: 100)
    #[serde(default = "default_max_cache_entries")]
    pub max_cache_entries: usize,
    /// Age after which a cached file is re-read (default: 30s)
    #[serde(
        default = "default_cache_expiry",
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize"
    )]
    pub cache_expiry: Duration,
}

fn default_max_cache_entries() -> usize {
    100
}

fn default_cache_expiry() -> Duration {
    Duration::from_secs(30)
}

impl Default for FileStoreConfig {
    fn default() -> Self {
        Self {
            max_cache_entries: default_max_cache_entries(),
            cache_expiry: default_cache_expiry(),
        }
    }
}

impl FileStoreConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_cache_entries == 0 {
            return Err("max_cache_entries must be at least 1".to_string());
        }
        if self.cache_expiry.is_zero() {
            return Err("cache_expiry must be positive".to_string());
        }
        Ok(())
    }

    pub fn to_store_config(&self) -> AtomicFileStoreConfig {
        AtomicFileStoreConfig {
            max_cache_entries: self.max_cache_entries,
            cache_expiry: self.cache_expiry,
        }
    }
}

/// Region handle cache
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionCacheConfig {
    /// Maximum simultaneously open region files (default: 256)
    #[serde(default = "default_max_open_regions")]
    pub max_open_regions: usize,
}

fn default_max_open_regions() -> usize {
    crate::region_cache::DEFAULT_MAX_OPEN_REGIONS
}

impl Default for RegionCacheConfig {
    fn default() -> Self {
        Self {
            max_open_regions: default_max_open_regions(),
        }
    }
}

impl RegionCacheConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.max_open_regions == 0 {
            return Err("max_open_regions must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Stripe tables and distributed chunk locks
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocksConfig {
    /// Stripes guarding chunk access, power of two (default: 64)
    #[serde(default = "default_stripes")]
    pub chunk_stripes: usize,
    /// Stripes guarding entity containers, power of two (default: 64)
    #[serde(default = "default_stripes")]
    pub entity_stripes: usize,
    /// Time a chunk stays locked without explicit release (default: 30s)
    #[serde(
        default = "default_lock_timeout",
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize"
    )]
    pub lock_timeout: Duration,
    /// Interval between sweeps of leaked lock entries (default: 60s)
    #[serde(
        default = "default_cleanup_interval",
        deserialize_with = "duration_serde::deserialize",
        serialize_with = "duration_serde::serialize"
    )]
    pub cleanup_interval: Duration,
}

fn default_stripes() -> usize {
    DEFAULT_STRIPE_COUNT
}

fn default_lock_timeout() -> Duration {
    crate::chunk_lock_manager::DEFAULT_LOCK_TIMEOUT
}

fn default_cleanup_interval() -> Duration {
    crate::chunk_lock_manager::DEFAULT_CLEANUP_INTERVAL
}

impl Default for LocksConfig {
    fn default() -> Self {
        Self {
            chunk_stripes: default_stripes(),
            entity_stripes: default_stripes(),
            lock_timeout: default_lock_timeout(),
            cleanup_interval: default_cleanup_interval(),
        }
    }
}

impl LocksConfig {
    pub fn validate(&self) -> std::result::Result<(), String> {
        validate_stripe_count("chunk", self.chunk_stripes).map_err(|e| e.to_string())?;
        validate_stripe_count("entities", self.entity_stripes).map_err(|e| e.to_string())?;
        if self.lock_timeout.is_zero() {
            return Err("lock_timeout must be positive".to_string());
        }
        if self.cleanup_interval.is_zero() {
            return Err("cleanup_interval must be positive".to_string());
        }
        if self.lock_timeout > MAX_LOCK_DURATION || self.cleanup_interval > MAX_LOCK_DURATION {
            return Err(format!(
                "lock_timeout and cleanup_interval must not exceed {}",
                duration_serde::format_duration(MAX_LOCK_DURATION)
            ));
        }
        Ok(())
    }

    pub fn to_lock_manager_config(&self) -> ChunkLockManagerConfig {
        ChunkLockManagerConfig {
            default_timeout: self.lock_timeout,
            cleanup_interval: self.cleanup_interval,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Directory for daily rolling log files; console only when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_dir: None,
        }
    }
}

impl Config {
    /// Build the configuration from parsed command-line arguments:
    /// defaults, then `--config` file, then environment, then flags.
    pub fn from_matches(matches: &ArgMatches) -> Result<Self> {
        let mut config = match matches.get_one::<String>("config") {
            Some(path) => Self::load_from_file(Path::new(path))?,
            None => Self::default(),
        };

        config.apply_env_overrides();
        config.apply_cli_overrides(matches);
        config.validate()?;

        Ok(config)
    }

    /// Log the effective settings. Call once logging is initialized.
    pub fn log_summary(&self) {
        info!(
            "Configuration loaded: chunk_stripes={}, entity_stripes={}, max_open_regions={}, file_cache_entries={}, lock_timeout={}",
            self.locks.chunk_stripes,
            self.locks.entity_stripes,
            self.region_cache.max_open_regions,
            self.file_store.max_cache_entries,
            duration_serde::format_duration(self.locks.lock_timeout)
        );
        debug!("Configuration: {:?}", self);
    }

    /// Arguments shared by every subcommand of the binary.
    pub fn cli_args() -> Vec<Arg> {
        vec![
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .global(true)
                .help("Configuration file path"),
            Arg::new("log-level")
                .long("log-level")
                .value_name("LEVEL")
                .global(true)
                .help("Log level: trace, debug, info, warn, error (default: info)"),
            Arg::new("log-dir")
                .long("log-dir")
                .value_name("DIR")
                .global(true)
                .help("Write daily rolling log files to this directory"),
            Arg::new("max-open-regions")
                .long("max-open-regions")
                .value_name("COUNT")
                .global(true)
                .help("Maximum open region files (default: 256)"),
            Arg::new("chunk-stripes")
                .long("chunk-stripes")
                .value_name("COUNT")
                .global(true)
                .help("Chunk lock stripes, power of two (default: 64)"),
            Arg::new("entity-stripes")
                .long("entity-stripes")
                .value_name("COUNT")
                .global(true)
                .help("Entity lock stripes, power of two (default: 64)"),
        ]
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            StoreError::ConfigError(format!("Failed to read config file {:?}: {}", path, e))
        })?;

        let config: Self = serde_yaml::from_str(&content).map_err(|e| {
            StoreError::ConfigError(format!("Failed to parse config file {:?}: {}", path, e))
        })?;

        Ok(config)
    }

    /// Apply environment variable overrides
    pub fn apply_env_overrides(&mut self) {
        self.apply_env_overrides_from(|name| std::env::var(name).ok());
    }

    /// Apply overrides from `lookup`, which maps a variable name to its value.
    /// Unparseable values are ignored and leave the current setting in place.
    pub fn apply_env_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(entries) = lookup("FILE_CACHE_MAX_ENTRIES") {
            if let Ok(entries) = entries.parse() {
                self.file_store.max_cache_entries = entries;
            }
        }

        if let Some(expiry) = lookup("FILE_CACHE_EXPIRY") {
            if let Ok(expiry) = duration_serde::parse_duration(&expiry) {
                self.file_store.cache_expiry = expiry;
            }
        }

        if let Some(handles) = lookup("REGION_CACHE_MAX_HANDLES") {
            if let Ok(handles) = handles.parse() {
                self.region_cache.max_open_regions = handles;
            }
        }

        if let Some(stripes) = lookup("CHUNK_LOCK_STRIPES") {
            if let Ok(stripes) = stripes.parse() {
                self.locks.chunk_stripes = stripes;
            }
        }

        if let Some(stripes) = lookup("ENTITY_LOCK_STRIPES") {
            if let Ok(stripes) = stripes.parse() {
                self.locks.entity_stripes = stripes;
            }
        }

        if let Some(timeout) = lookup("CHUNK_LOCK_TIMEOUT") {
            if let Ok(timeout) = duration_serde::parse_duration(&timeout) {
                self.locks.lock_timeout = timeout;
            }
        }

        if let Some(interval) = lookup("CHUNK_LOCK_CLEANUP_INTERVAL") {
            if let Ok(interval) = duration_serde::parse_duration(&interval) {
                self.locks.cleanup_interval = interval;
            }
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.log_level = level;
        }

        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
    }

    /// Apply command line argument overrides
    fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(level) = matches.get_one::<String>("log-level") {
            self.logging.log_level = level.clone();
        }

        if let Some(dir) = matches.get_one::<String>("log-dir") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }

        if let Some(handles) = matches.get_one::<String>("max-open-regions") {
            if let Ok(handles) = handles.parse() {
                self.region_cache.max_open_regions = handles;
            }
        }

        if let Some(stripes) = matches.get_one::<String>("chunk-stripes") {
            if let Ok(stripes) = stripes.parse() {
                self.locks.chunk_stripes = stripes;
            }
        }

        if let Some(stripes) = matches.get_one::<String>("entity-stripes") {
            if let Ok(stripes) = stripes.parse() {
                self.locks.entity_stripes = stripes;
            }
        }
    }

    /// Check every section. The first invalid value fails the whole configuration.
    pub fn validate(&self) -> Result<()> {
        if let Err(e) = self.file_store.validate() {
            return Err(StoreError::ConfigError(format!(
                "Invalid file store configuration: {}",
                e
            )));
        }

        if let Err(e) = self.region_cache.validate() {
            return Err(StoreError::ConfigError(format!(
                "Invalid region cache configuration: {}",
                e
            )));
        }

        if let Err(e) = self.locks.validate() {
            return Err(StoreError::ConfigError(format!(
                "Invalid lock configuration: {}",
                e
            )));
        }

        Ok(())
    }

    pub fn to_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Command;
    use std::collections::HashMap;
    use tempfile::NamedTempFile;

    fn parse_args(args: &[&str]) -> ArgMatches {
        Command::new("region-store")
            .args(Config::cli_args())
            .try_get_matches_from(args)
            .unwrap()
    }

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.file_store.max_cache_entries, 100);
        assert_eq!(config.file_store.cache_expiry, Duration::from_secs(30));
        assert_eq!(config.region_cache.max_open_regions, 256);
        assert_eq!(config.locks.chunk_stripes, 64);
        assert_eq!(config.locks.entity_stripes, 64);
        assert_eq!(config.locks.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.locks.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.logging.log_level, "info");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_duration_parsing() {
        use duration_serde::parse_duration;
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("2").unwrap(), Duration::from_secs(2));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("soon").is_err());
        assert!(parse_duration("5 fortnights").is_err());

        let oversized = parse_duration("99999999999999999999s").unwrap_err();
        assert!(oversized.contains("out of range"), "{}", oversized);
        assert!(parse_duration("999999999999999999h").is_err());
    }

    #[test]
    fn test_duration_formatting() {
        use duration_serde::format_duration;
        assert_eq!(format_duration(Duration::from_secs(30)), "30s");
        assert_eq!(format_duration(Duration::from_millis(1500)), "1500ms");
    }

    #[test]
    fn test_partial_yaml_uses_defaults() {
        let yaml = r#"
locks:
  chunk_stripes: 128
  lock_timeout: "10s"
file_store:
  cache_expiry: "500ms"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.locks.chunk_stripes, 128);
        assert_eq!(config.locks.entity_stripes, 64);
        assert_eq!(config.locks.lock_timeout, Duration::from_secs(10));
        assert_eq!(config.locks.cleanup_interval, Duration::from_secs(60));
        assert_eq!(config.file_store.cache_expiry, Duration::from_millis(500));
        assert_eq!(config.file_store.max_cache_entries, 100);
        assert_eq!(config.region_cache.max_open_regions, 256);
    }

    #[test]
    fn test_yaml_round_trip_through_show_format() {
        let mut config = Config::default();
        config.file_store.cache_expiry = Duration::from_millis(250);
        let yaml = config.to_yaml().unwrap();
        assert!(yaml.contains("cache_expiry: 250ms"));

        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.file_store.cache_expiry, Duration::from_millis(250));
        assert_eq!(parsed.locks.lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn test_load_from_file() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "region_cache:\n  max_open_regions: 8\n").unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.region_cache.max_open_regions, 8);
    }

    #[test]
    fn test_load_from_missing_or_invalid_file() {
        let missing = Config::load_from_file(Path::new("/nonexistent/region-store.yaml"));
        assert!(matches!(missing, Err(StoreError::ConfigError(_))));

        let file = NamedTempFile::new().unwrap();
        std::fs::write(file.path(), "locks:\n  lock_timeout: \"forever\"\n").unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(StoreError::ConfigError(_))
        ));

        std::fs::write(
            file.path(),
            "locks:\n  lock_timeout: \"99999999999999999999s\"\n",
        )
        .unwrap();
        assert!(matches!(
            Config::load_from_file(file.path()),
            Err(StoreError::ConfigError(_))
        ));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("FILE_CACHE_MAX_ENTRIES", "10"),
            ("FILE_CACHE_EXPIRY", "5s"),
            ("REGION_CACHE_MAX_HANDLES", "16"),
            ("CHUNK_LOCK_STRIPES", "32"),
            ("ENTITY_LOCK_STRIPES", "8"),
            ("CHUNK_LOCK_TIMEOUT", "1m"),
            ("CHUNK_LOCK_CLEANUP_INTERVAL", "90s"),
            ("LOG_LEVEL", "debug"),
            ("LOG_DIR", "/var/log/region-store"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        config.apply_env_overrides_from(|name| env.get(name).map(|v| v.to_string()));

        assert_eq!(config.file_store.max_cache_entries, 10);
        assert_eq!(config.file_store.cache_expiry, Duration::from_secs(5));
        assert_eq!(config.region_cache.max_open_regions, 16);
        assert_eq!(config.locks.chunk_stripes, 32);
        assert_eq!(config.locks.entity_stripes, 8);
        assert_eq!(config.locks.lock_timeout, Duration::from_secs(60));
        assert_eq!(config.locks.cleanup_interval, Duration::from_secs(90));
        assert_eq!(config.logging.log_level, "debug");
        assert_eq!(
            config.logging.log_dir,
            Some(PathBuf::from("/var/log/region-store"))
        );
    }

    #[test]
    fn test_unparseable_env_values_are_ignored() {
        let mut config = Config::default();
        config.apply_env_overrides_from(|name| match name {
            "CHUNK_LOCK_STRIPES" => Some("lots".to_string()),
            "CHUNK_LOCK_TIMEOUT" => Some("eventually".to_string()),
            "CHUNK_LOCK_CLEANUP_INTERVAL" => Some("99999999999999999999s".to_string()),
            _ => None,
        });
        assert_eq!(config.locks.chunk_stripes, 64);
        assert_eq!(config.locks.lock_timeout, Duration::from_secs(30));
        assert_eq!(config.locks.cleanup_interval, Duration::from_secs(60));
    }

    #[test]
    fn test_validation_rejects_bad_stripes() {
        let mut config = Config::default();
        config.locks.entity_stripes = 48;
        match config.validate() {
            Err(StoreError::ConfigError(msg)) => {
                assert!(msg.contains("lock configuration"));
                assert!(msg.contains("entities"));
            }
            other => panic!("Expected ConfigError, got {:?}", other),
        }

        config.locks.entity_stripes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_zero_values() {
        let mut config = Config::default();
        config.region_cache.max_open_regions = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.file_store.max_cache_entries = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.locks.cleanup_interval = Duration::ZERO;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_huge_lock_durations() {
        let mut config = Config::default();
        config.locks.lock_timeout = Duration::from_secs(10_000_000_000_000_000_000);
        match config.validate() {
            Err(StoreError::ConfigError(msg)) => assert!(msg.contains("must not exceed")),
            other => panic!("Expected ConfigError, got {:?}", other),
        }

        let mut config = Config::default();
        config.locks.cleanup_interval = Duration::MAX;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.locks.lock_timeout = MAX_LOCK_DURATION;
        config.locks.cleanup_interval = MAX_LOCK_DURATION;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_cli_overrides_file_and_env() {
        let file = NamedTempFile::new().unwrap();
        std::fs::write(
            file.path(),
            "locks:\n  chunk_stripes: 16\nregion_cache:\n  max_open_regions: 4\n",
        )
        .unwrap();
        let path = file.path().to_string_lossy().to_string();

        let matches = parse_args(&[
            "region-store",
            "--config",
            &path,
            "--chunk-stripes",
            "256",
            "--log-level",
            "warn",
        ]);
        let mut config = Config::load_from_file(file.path()).unwrap();
        config.apply_cli_overrides(&matches);

        assert_eq!(config.locks.chunk_stripes, 256);
        assert_eq!(config.region_cache.max_open_regions, 4);
        assert_eq!(config.logging.log_level, "warn");
    }

    #[test]
    fn test_from_matches_validates() {
        let matches = parse_args(&["region-store", "--chunk-stripes", "100"]);
        assert!(matches!(
            Config::from_matches(&matches),
            Err(StoreError::ConfigError(_))
        ));
    }

    #[derive(Clone, Default)]
    struct CapturedLog(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for CapturedLog {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_from_matches_is_silent_until_summary() {
        let captured = CapturedLog::default();
        let writer = captured.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .with_writer(move || writer.clone())
            .finish();

        tracing::subscriber::with_default(subscriber, || {
            let matches = parse_args(&["region-store", "--chunk-stripes", "32"]);
            let config = Config::from_matches(&matches).unwrap();
            assert!(captured.0.lock().unwrap().is_empty());

            config.log_summary();
        });

        let output = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(output.contains("Configuration loaded"), "{}", output);
        assert!(output.contains("chunk_stripes=32"), "{}", output);
        assert!(output.contains("lock_timeout=30s"), "{}", output);
    }
}
