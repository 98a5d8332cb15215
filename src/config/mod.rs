//! Unified configuration for the identity subsystem.
//!
//! Configuration is loaded with precedence: CLI args > Env vars > Config file > Defaults
//!
//! # Example config file (occid.toml)
//! ```toml
//! [store]
//! data_dir = "/var/lib/occid"
//!
//! [locks]
//! wait_ms = 500
//! attempts = 8
//!
//! [uniqueness]
//! spill_threshold = 5000000
//! chunk_size = 50000
//!
//! [keys]
//! unique_terms = ["occurrenceID"]
//! ```
//!
//! Environment variables use the `OCCID_` prefix with `__` between sections,
//! e.g. `OCCID_LOCKS__WAIT_MS=500`.

mod defaults;

pub use defaults::*;

use crate::identity::LockPolicy;
use crate::locks::{KeyLockConfig, MAX_SHARD_BITS};
use crate::model::Term;
use crate::persistence::PersistentOpenOptions;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Main configuration for the identity subsystem.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    /// Durable identity store
    pub store: StoreConfig,
    /// Per-key lock policy
    pub locks: LockConfig,
    /// Batch uniqueness validation
    pub uniqueness: UniquenessConfig,
    /// Validation gate inputs
    pub gate: GateConfig,
    /// Identity terms
    pub keys: KeysConfig,
}

impl IdentityConfig {
    /// Load configuration with precedence: CLI args > Env > File > Defaults
    ///
    /// # Arguments
    /// * `config_path` - Optional path to TOML config file
    /// * `overrides` - CLI overrides to apply on top
    pub fn load(
        config_path: Option<&str>,
        overrides: ConfigOverrides,
    ) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(IdentityConfig::default()));

        // Layer 1: Config file (if provided)
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Layer 2: Environment variables with OCCID_ prefix
        figment = figment.merge(Env::prefixed("OCCID_").split("__"));

        // Layer 3: CLI overrides
        figment = figment.merge(Serialized::defaults(overrides));

        let config: IdentityConfig = figment.extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from environment and optional config file only (no CLI overrides)
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.locks.attempts == 0 {
            return Err(ConfigError::Invalid(
                "locks.attempts must be at least 1".to_string(),
            ));
        }
        if self.locks.shard_bits > MAX_SHARD_BITS {
            return Err(ConfigError::Invalid(format!(
                "locks.shard_bits must be at most {MAX_SHARD_BITS}, got {}",
                self.locks.shard_bits
            )));
        }
        if self.uniqueness.shards == 0 {
            return Err(ConfigError::Invalid(
                "uniqueness.shards must be at least 1".to_string(),
            ));
        }
        if self.uniqueness.chunk_size == 0 {
            return Err(ConfigError::Invalid(
                "uniqueness.chunk_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Durable store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// RocksDB directory for key associations
    pub data_dir: PathBuf,
    /// LRU read cache capacity (entries)
    pub cache_capacity: usize,
    /// Run repair on open
    pub repair: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            cache_capacity: DEFAULT_READ_CACHE_CAPACITY,
            repair: false,
        }
    }
}

impl StoreConfig {
    pub fn open_options(&self) -> PersistentOpenOptions {
        PersistentOpenOptions {
            repair: self.repair,
            cache_capacity: self.cache_capacity,
        }
    }
}

/// Per-key lock configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockConfig {
    pub wait_ms: u64,
    pub attempts: u32,
    pub backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub shard_bits: u8,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            wait_ms: DEFAULT_LOCK_WAIT_MS,
            attempts: DEFAULT_LOCK_ATTEMPTS,
            backoff_ms: DEFAULT_LOCK_BACKOFF_MS,
            max_backoff_ms: DEFAULT_LOCK_MAX_BACKOFF_MS,
            shard_bits: DEFAULT_LOCK_SHARD_BITS,
        }
    }
}

impl LockConfig {
    pub fn to_lock_policy(&self) -> LockPolicy {
        LockPolicy {
            wait: Duration::from_millis(self.wait_ms),
            max_attempts: self.attempts,
            initial_backoff: Duration::from_millis(self.backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
        }
    }

    pub fn to_lock_table_config(&self) -> KeyLockConfig {
        KeyLockConfig {
            shard_bits: self.shard_bits,
        }
    }
}

/// Uniqueness validation configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniquenessConfig {
    /// Keys held in memory per validator before spilling to disk
    pub spill_threshold: usize,
    /// Validator shards for parallel scans
    pub shards: usize,
    /// Keys buffered between parallel scan steps
    pub chunk_size: usize,
}

impl Default for UniquenessConfig {
    fn default() -> Self {
        Self {
            spill_threshold: DEFAULT_SPILL_THRESHOLD,
            shards: default_uniqueness_shards(),
            chunk_size: DEFAULT_VALIDATION_CHUNK_SIZE,
        }
    }
}

/// Validation gate configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GateConfig {
    /// Root of `<dataset>/<attempt>/` report directories
    pub report_root: PathBuf,
}

impl Default for GateConfig {
    fn default() -> Self {
        Self {
            report_root: PathBuf::from(DEFAULT_REPORT_ROOT),
        }
    }
}

/// Identity term configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysConfig {
    /// Ordered identity terms
    pub unique_terms: Vec<String>,
}

impl Default for KeysConfig {
    fn default() -> Self {
        Self {
            unique_terms: DEFAULT_UNIQUE_TERMS.iter().map(|t| t.to_string()).collect(),
        }
    }
}

impl KeysConfig {
    pub fn terms(&self) -> Vec<Term> {
        self.unique_terms
            .iter()
            .map(|t| t.trim())
            .filter(|t| !t.is_empty())
            .map(Term::new)
            .collect()
    }
}

/// CLI overrides that take precedence over file and env config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub store: Option<StoreOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateOverrides>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub keys: Option<KeysOverrides>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub repair: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GateOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub report_root: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct KeysOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unique_terms: Option<Vec<String>>,
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] figment::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
