//! # mdsync-config
//!
//! Configuration management for mdsync.
//!
//! Loads configuration from:
//! 1. `~/.mdsync/config.toml` (global)
//! 2. `.mdsync/config.toml` (project-local, overrides global)
//! 3. Environment variables (highest priority)
//!
//! The sync coordinator itself never reads the global instance; it is handed
//! a [`SyncConfig`] when the file is opened. The global accessor exists for
//! the command-line front end.

pub mod logging;
pub mod testing;

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::RwLock;
use tracing::debug;

/// Global config instance
static CONFIG: Lazy<RwLock<Config>> = Lazy::new(|| RwLock::new(Config::load().unwrap_or_default()));

/// Get a snapshot of the global config
pub fn config() -> Config {
    match CONFIG.read() {
        Ok(guard) => guard.clone(),
        Err(poisoned) => poisoned.into_inner().clone(),
    }
}

/// Reload config from disk
pub fn reload() -> Result<(), ConfigError> {
    let new_config = Config::load()?;
    match CONFIG.write() {
        Ok(mut guard) => *guard = new_config,
        Err(poisoned) => *poisoned.into_inner() = new_config,
    }
    Ok(())
}

/// Default dirty-byte threshold that triggers an autonomous sync point (256 KiB).
pub const DEFAULT_DIRTY_BYTES_THRESHOLD: u64 = 256 * 1024;

/// Default maximum cache size (2 MiB).
pub const DEFAULT_MAX_CACHE_SIZE: u64 = 2 * 1024 * 1024;

/// Default fraction of the cache that should be kept clean.
pub const DEFAULT_MIN_CLEAN_FRACTION: f64 = 0.3;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Which processes may physically write metadata to the shared file.
///
/// Fixed for the lifetime of an open file and identical on every process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum WriteStrategy {
    /// Only the coordinator rank writes; everyone else is told what became clean.
    Centralized,
    /// Every rank writes a round-robin share of a locally derived candidate list.
    #[default]
    Distributed,
}

impl WriteStrategy {
    /// Stable one-byte tag used when ranks compare their settings.
    pub fn tag(self) -> u8 {
        match self {
            WriteStrategy::Centralized => 0,
            WriteStrategy::Distributed => 1,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            WriteStrategy::Centralized => "centralized",
            WriteStrategy::Distributed => "distributed",
        }
    }
}

impl fmt::Display for WriteStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for WriteStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "centralized" | "process_0_only" | "p0" => Ok(WriteStrategy::Centralized),
            "distributed" | "dist" => Ok(WriteStrategy::Distributed),
            other => Err(ConfigError::Invalid(format!(
                "unknown write strategy '{}'",
                other
            ))),
        }
    }
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub sync: SyncConfig,
    pub cache: CacheConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Load config from standard locations
    pub fn load() -> Result<Self, ConfigError> {
        let global = Self::global_config_path();
        Self::load_from(global.as_deref(), Path::new(".mdsync/config.toml"))
    }

    /// Load config from explicit global and project paths.
    ///
    /// Missing files are skipped. Environment overrides are applied last.
    pub fn load_from(global: Option<&Path>, project: &Path) -> Result<Self, ConfigError> {
        let mut config = Config::default();

        // 1. Global config
        if let Some(global_path) = global {
            if global_path.exists() {
                debug!("Loading global config from {:?}", global_path);
                let contents = std::fs::read_to_string(global_path)?;
                config = toml::from_str(&contents)?;
            }
        }

        // 2. Project config - overrides global
        if project.exists() {
            debug!("Loading project config from {:?}", project);
            let contents = std::fs::read_to_string(project)?;
            let overlay: toml::Table = toml::from_str(&contents)?;
            config.merge(overlay)?;
        }

        // 3. Environment variable overrides
        config.apply_env_overrides()?;

        Ok(config)
    }

    /// Global config path: ~/.mdsync/config.toml
    pub fn global_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|h| h.join(".mdsync/config.toml"))
    }

    /// Merge a project overlay: only keys present in the overlay replace ours.
    fn merge(&mut self, overlay: toml::Table) -> Result<(), ConfigError> {
        let mut base = toml::Table::try_from(&*self)
            .map_err(|e| ConfigError::Invalid(format!("cannot serialize config: {}", e)))?;
        for (section, value) in overlay {
            match (base.get_mut(&section), value) {
                (Some(toml::Value::Table(dst)), toml::Value::Table(src)) => {
                    for (key, v) in src {
                        dst.insert(key, v);
                    }
                }
                (_, value) => {
                    base.insert(section, value);
                }
            }
        }
        *self = base.try_into()?;
        Ok(())
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Ok(strategy) = std::env::var("MDSYNC_WRITE_STRATEGY") {
            self.sync.write_strategy = strategy.parse()?;
        }
        if let Ok(threshold) = std::env::var("MDSYNC_DIRTY_BYTES_THRESHOLD") {
            self.sync.dirty_bytes_threshold = threshold.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("MDSYNC_DIRTY_BYTES_THRESHOLD='{}'", threshold))
            })?;
        }
        if let Ok(fraction) = std::env::var("MDSYNC_MIN_CLEAN_FRACTION") {
            self.cache.min_clean_fraction = fraction.trim().parse().map_err(|_| {
                ConfigError::Invalid(format!("MDSYNC_MIN_CLEAN_FRACTION='{}'", fraction))
            })?;
        }
        if let Ok(level) = std::env::var("MDSYNC_LOG") {
            self.logging.level = level;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sync.validate()?;
        self.cache.validate()?;
        self.logging.level()?;
        Ok(())
    }

    /// Generate default config TOML string
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Config::default()).unwrap_or_default()
    }
}

/// Sync point configuration, shared verbatim by every process of a file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Which processes write metadata
    pub write_strategy: WriteStrategy,
    /// Newly dirtied bytes that trigger an autonomous sync point
    pub dirty_bytes_threshold: u64,
    /// Exchange a digest of the candidate list along with its length
    pub verify_candidate_digest: bool,
    /// Rank that writes under the centralized strategy and keeps the tracked sets
    pub coordinator_rank: usize,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            write_strategy: WriteStrategy::default(),
            dirty_bytes_threshold: DEFAULT_DIRTY_BYTES_THRESHOLD,
            verify_candidate_digest: true,
            coordinator_rank: 0,
        }
    }
}

impl SyncConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dirty_bytes_threshold == 0 {
            return Err(ConfigError::Invalid(
                "sync.dirty_bytes_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Parameters of the per-process metadata cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum cache size in bytes
    pub max_size: u64,
    /// Fraction of `max_size` that should be clean or free
    pub min_clean_fraction: f64,
    /// Whether the cache may evict (and so flush to min clean) at all
    pub evictions_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: DEFAULT_MAX_CACHE_SIZE,
            min_clean_fraction: DEFAULT_MIN_CLEAN_FRACTION,
            evictions_enabled: true,
        }
    }
}

impl CacheConfig {
    /// Bytes that must be clean or free for the cache to be within budget.
    pub fn min_clean_size(&self) -> u64 {
        (self.max_size as f64 * self.min_clean_fraction) as u64
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("cache.max_size must be positive".to_string()));
        }
        if !(0.0..=1.0).contains(&self.min_clean_fraction) {
            return Err(ConfigError::Invalid(format!(
                "cache.min_clean_fraction {} outside [0, 1]",
                self.min_clean_fraction
            )));
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// error, warn, info, debug or trace
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl LoggingConfig {
    pub fn level(&self) -> Result<logging::LogLevel, ConfigError> {
        self.level.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.sync.write_strategy, WriteStrategy::Distributed);
        assert_eq!(config.sync.dirty_bytes_threshold, 256 * 1024);
        assert!(config.cache.evictions_enabled);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_toml_generation() {
        let toml_str = Config::default_toml();
        assert!(toml_str.contains("[sync]"));
        assert!(toml_str.contains("[cache]"));
        assert!(toml_str.contains("write_strategy = \"distributed\""));
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.sync, parsed.sync);
        assert_eq!(config.cache, parsed.cache);
    }

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "Centralized".parse::<WriteStrategy>().unwrap(),
            WriteStrategy::Centralized
        );
        assert_eq!(
            "dist".parse::<WriteStrategy>().unwrap(),
            WriteStrategy::Distributed
        );
        assert!("round_robin".parse::<WriteStrategy>().is_err());
    }

    #[test]
    fn test_strategy_tags_differ() {
        assert_ne!(
            WriteStrategy::Centralized.tag(),
            WriteStrategy::Distributed.tag()
        );
    }

    #[test]
    fn test_min_clean_size() {
        let cache = CacheConfig {
            max_size: 64,
            min_clean_fraction: 0.75,
            evictions_enabled: true,
        };
        assert_eq!(cache.min_clean_size(), 48);
    }

    #[test]
    fn test_validate_rejects_bad_fraction() {
        let mut config = Config::default();
        config.cache.min_clean_fraction = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_zero_threshold() {
        let mut config = Config::default();
        config.sync.dirty_bytes_threshold = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_merge_only_replaces_present_keys() {
        let mut config = Config::default();
        config.sync.write_strategy = WriteStrategy::Centralized;
        let overlay: toml::Table = toml::from_str("[cache]\nmax_size = 4096\n").unwrap();
        config.merge(overlay).unwrap();
        assert_eq!(config.cache.max_size, 4096);
        assert_eq!(config.sync.write_strategy, WriteStrategy::Centralized);
        assert_eq!(config.cache.min_clean_fraction, DEFAULT_MIN_CLEAN_FRACTION);
    }
}
