//! Tunables for the metadata cache and the block synchronization engine.
//!
//! Configuration is read from a kebab-case TOML document. Every field has a default, so an empty
//! document is a valid configuration.

use std::path::Path;
use std::time::Duration;

use bytesize::ByteSize;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

/// Entry store sizing and directory expiry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CacheConfig {
    /// Maximum number of cached entries before LRU eviction kicks in.
    pub max_entries: usize,

    /// Seconds a complete directory listing is served without refetching.
    pub directory_expiry_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 20_000,
            directory_expiry_secs: 5,
        }
    }
}

/// Directory listing behaviour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ReaddirConfig {
    /// Number of children requested per remote page.
    pub prefetch_size: usize,

    /// Hide regular files whose data is not fully replicated locally.
    pub show_only_full_replicas: bool,
}

impl Default for ReaddirConfig {
    fn default() -> Self {
        Self {
            prefetch_size: 1000,
            show_only_full_replicas: false,
        }
    }
}

/// Block synchronization and retry policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SyncConfig {
    /// Smallest range requested from the remote side in one synchronization.
    pub min_block_size: ByteSize,

    /// How many `TryAgain` answers are retried before giving up.
    pub try_again_retries: u32,

    /// How many `Canceled` answers are retried before giving up.
    pub canceled_retries: u32,

    /// Base delay between retries, doubled on every attempt.
    pub retry_delay_ms: u64,

    /// Upper bound for the retry delay.
    pub max_retry_delay_ms: u64,

    /// Verify checksums even when the storage helper does not ask for it.
    pub verify_checksums: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            min_block_size: ByteSize::mib(1),
            try_again_retries: 3,
            canceled_retries: 5,
            retry_delay_ms: 10,
            max_retry_delay_ms: 1000,
            verify_checksums: false,
        }
    }
}

/// Complete client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Config {
    /// Entry store configuration.
    pub cache: CacheConfig,

    /// Directory listing configuration.
    pub readdir: ReaddirConfig,

    /// Synchronization configuration.
    pub sync: SyncConfig,

    /// Seconds to wait for any single remote request.
    pub provider_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            readdir: ReaddirConfig::default(),
            sync: SyncConfig::default(),
            provider_timeout_secs: 30,
        }
    }
}

/// Errors raised while loading a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration parsed but failed validation.
    #[error("Configuration validation errors: {0:?}")]
    ValidationErrors(Vec<String>),

    /// The TOML document was malformed.
    #[error("Deserialization error: {0}")]
    DeserializationError(#[from] toml::de::Error),

    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Config {
    /// Validate the correctness of the configuration.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cache.max_entries == 0 {
            errors.push("cache.max-entries must be greater than zero.".to_owned());
        }
        if self.readdir.prefetch_size == 0 {
            errors.push("readdir.prefetch-size must be greater than zero.".to_owned());
        }
        if self.sync.min_block_size.as_u64() == 0 {
            errors.push("sync.min-block-size must be greater than zero.".to_owned());
        }
        if self.sync.max_retry_delay_ms < self.sync.retry_delay_ms {
            errors.push(format!(
                "sync.max-retry-delay-ms ({}) is below sync.retry-delay-ms ({}).",
                self.sync.max_retry_delay_ms, self.sync.retry_delay_ms
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate().map_err(ConfigError::ValidationErrors)?;
        Ok(config)
    }

    /// Loads and validates configuration from a single TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!(path = ?path, "Loading configuration file.");
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// How long a complete directory listing stays fresh.
    #[must_use]
    pub fn directory_expiry(&self) -> Duration {
        Duration::from_secs(self.cache.directory_expiry_secs)
    }

    /// Deadline applied to every remote request.
    #[must_use]
    pub fn provider_timeout(&self) -> Duration {
        Duration::from_secs(self.provider_timeout_secs)
    }
}
