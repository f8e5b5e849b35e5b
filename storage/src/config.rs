// Configuration management with layered configuration (file, env)

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main settings structure containing all configuration options
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    pub database: DatabaseConfig,
    pub observability: ObservabilityConfig,
}

/// Backing store and connection pool configuration
///
/// Read once at process start; the pool is constructed from these values and
/// never reconfigured in flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Store connection string (backend-specific)
    pub url: String,
    /// Connections opened eagerly at pool init
    #[serde(default = "default_min_size")]
    pub min_size: u32,
    /// Upper bound of recycled connections
    #[serde(default = "default_max_size")]
    pub max_size: u32,
    /// Transient connections beyond max_size allowed under burst load,
    /// closed first on release
    #[serde(default)]
    pub max_overflow: u32,
    /// How long an acquire waits for capacity before PoolExhausted
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Probe connection liveness on release, replacing broken connections
    #[serde(default = "default_true")]
    pub health_check_on_release: bool,
    /// How long shutdown waits for in-flight connections before force-closing
    #[serde(default = "default_shutdown_grace_ms")]
    pub shutdown_grace_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    pub log_level: String,
}

fn default_min_size() -> u32 {
    1
}

fn default_max_size() -> u32 {
    10
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

fn default_shutdown_grace_ms() -> u64 {
    10_000
}

fn default_true() -> bool {
    true
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "memory://local".to_string(),
            min_size: default_min_size(),
            max_size: default_max_size(),
            max_overflow: 0,
            acquire_timeout_ms: default_acquire_timeout_ms(),
            health_check_on_release: true,
            shutdown_grace_ms: default_shutdown_grace_ms(),
        }
    }
}

impl Settings {
    /// Load configuration with layered precedence: defaults → file → env
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from_path("config")
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(config_dir: P) -> Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            // Start with default configuration
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Add local configuration (not committed to git)
            .add_source(File::from(config_dir.join("local.toml")).required(false))
            // Add environment-specific configuration
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Validate configuration settings
    pub fn validate(&self) -> Result<(), String> {
        if self.database.url.is_empty() {
            return Err("Database URL must not be empty".to_string());
        }
        if self.database.max_size == 0 {
            return Err("Database max_size must be greater than 0".to_string());
        }
        if self.database.min_size > self.database.max_size {
            return Err(format!(
                "Database min_size ({}) must not exceed max_size ({})",
                self.database.min_size, self.database.max_size
            ));
        }
        if self.database.acquire_timeout_ms == 0 {
            return Err("Database acquire_timeout_ms must be greater than 0".to_string());
        }
        Ok(())
    }
}
