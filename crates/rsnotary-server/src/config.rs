//! Configuration management for the notarization engine.
//!
//! Configuration is loaded from up to three sources:
//! 1. Default values (hardcoded)
//! 2. Configuration file (YAML)
//! 3. Environment variables (override)
//!
//! Environment variables take precedence over config file values, which
//! take precedence over defaults. Variables are prefixed with `RSNOTARY_`
//! and use `__` as the nested key separator:
//!
//! - `RSNOTARY_ENGINE__MAX_BATCH_SIZE=256` overrides `engine.max_batch_size`
//! - `RSNOTARY_STORAGE__DATABASE_URL=...` overrides `storage.database_url`
//!
//! # Example
//!
//! ```ignore
//! use rsnotary_server::config::NotaryConfig;
//!
//! // Load from file with env overrides
//! let config = NotaryConfig::load("notary.yaml")?;
//!
//! // Or load from environment only
//! let config = NotaryConfig::from_env()?;
//! ```

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use rsnotary_storage::{PostgresConfig, PostgresStore, StorageError, UniquenessStore};

/// Top-level engine configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct NotaryConfig {
    /// Batching and retry settings
    #[serde(default)]
    pub engine: EngineSettings,

    /// Storage settings
    #[serde(default)]
    pub storage: StorageSettings,

    /// Logging settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Batching, queueing, and retry tuning.
///
/// These are throughput/latency knobs, not correctness mechanisms: the
/// resolver's ordering guarantees hold for any batch size or timeout.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct EngineSettings {
    /// Capacity of the bounded request queue. `commit` blocks while the
    /// queue is full — backpressure, not rejection.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Stop draining a batch once it holds this many requests.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// ... or once this much time has passed since the batch's first
    /// request arrived, whichever comes first.
    #[serde(default = "default_batch_timeout_ms")]
    pub batch_timeout_ms: u64,

    /// Upper bound on the number of state references per store lookup;
    /// larger conflict queries are chunked.
    #[serde(default = "default_max_lookup_size")]
    pub max_lookup_size: usize,

    /// Maximum store transaction attempts per batch before the whole
    /// batch fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base backoff sleep after a transient store error; doubles per
    /// attempt.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            max_batch_size: default_max_batch_size(),
            batch_timeout_ms: default_batch_timeout_ms(),
            max_lookup_size: default_max_lookup_size(),
            max_retries: default_max_retries(),
            backoff_base_ms: default_backoff_base_ms(),
        }
    }
}

impl EngineSettings {
    pub fn batch_timeout(&self) -> Duration {
        Duration::from_millis(self.batch_timeout_ms)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_max_batch_size() -> usize {
    128
}

fn default_batch_timeout_ms() -> u64 {
    100
}

fn default_max_lookup_size() -> usize {
    512
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base_ms() -> u64 {
    20
}

/// Storage backend settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct StorageSettings {
    /// Storage backend type: "memory" or "postgres"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Database connection URL (required if backend is "postgres")
    pub database_url: Option<String>,

    /// Connection pool size
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout_secs: u64,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            database_url: None,
            pool_size: default_pool_size(),
            connection_timeout_secs: default_connection_timeout(),
        }
    }
}

fn default_storage_backend() -> String {
    "memory".to_string()
}

fn default_pool_size() -> u32 {
    10
}

fn default_connection_timeout() -> u64 {
    5
}

/// Logging settings.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub struct LoggingSettings {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Use JSON format (true for production, false for development)
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Error type for configuration loading.
#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] ConfigError),

    #[error("configuration file not found: {path}")]
    FileNotFound { path: String },

    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl NotaryConfig {
    /// Load configuration from a YAML file with environment variable
    /// overrides.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigLoadError> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ConfigLoadError::FileNotFound {
                path: path.display().to_string(),
            });
        }

        let config: NotaryConfig = Config::builder()
            .add_source(File::from(path).format(FileFormat::Yaml))
            .add_source(Environment::with_prefix("RSNOTARY").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from environment variables only.
    pub fn from_env() -> Result<Self, ConfigLoadError> {
        let config: NotaryConfig = Config::builder()
            .add_source(Environment::with_prefix("RSNOTARY").separator("__"))
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigLoadError> {
        if self.engine.queue_capacity == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "engine.queue_capacity must be at least 1".to_string(),
            });
        }
        if self.engine.max_batch_size == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "engine.max_batch_size must be at least 1".to_string(),
            });
        }
        if self.engine.max_lookup_size == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "engine.max_lookup_size must be at least 1".to_string(),
            });
        }
        if self.engine.max_retries == 0 {
            return Err(ConfigLoadError::Invalid {
                message: "engine.max_retries must be at least 1".to_string(),
            });
        }
        if self.storage.backend == "postgres" && self.storage.database_url.is_none() {
            return Err(ConfigLoadError::Invalid {
                message: "storage.database_url is required for the postgres backend"
                    .to_string(),
            });
        }
        Ok(())
    }
}

/// Error constructing a storage backend from settings.
#[derive(Debug, thiserror::Error)]
pub enum BuildStoreError {
    #[error("unknown storage backend: {backend}")]
    UnknownBackend { backend: String },

    #[error("storage.database_url is required for the postgres backend")]
    MissingDatabaseUrl,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Constructs the configured storage backend, running migrations for the
/// relational one.
pub async fn build_store(
    settings: &StorageSettings,
) -> Result<Arc<dyn UniquenessStore>, BuildStoreError> {
    match settings.backend.as_str() {
        "memory" => Ok(Arc::new(rsnotary_storage::MemoryStore::new())),
        "postgres" => {
            let database_url = settings
                .database_url
                .clone()
                .ok_or(BuildStoreError::MissingDatabaseUrl)?;
            let store = PostgresStore::from_config(&PostgresConfig {
                database_url,
                max_connections: settings.pool_size,
                connect_timeout_secs: settings.connection_timeout_secs,
            })
            .await?;
            store.run_migrations().await?;
            Ok(Arc::new(store))
        }
        other => Err(BuildStoreError::UnknownBackend {
            backend: other.to_string(),
        }),
    }
}
