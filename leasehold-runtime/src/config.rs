//! Runtime configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via LEASEHOLD_CONFIG or --config)
//! 3. Environment variables

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "LEASEHOLD_CONFIG";

/// Runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Identity this connector instance leases entities under.
    pub instance_id: String,
    /// State machine engine settings.
    pub engine: EngineConfig,
    /// Metrics configuration.
    pub metrics: MetricsConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            instance_id: format!("connector-{}", uuid::Uuid::new_v4()),
            engine: EngineConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl Config {
    /// Loads `path` (or the file named by LEASEHOLD_CONFIG), then applies
    /// environment overrides. Does not validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let file = path
            .map(Path::to_path_buf)
            .or_else(|| std::env::var(CONFIG_ENV).ok().map(PathBuf::from));

        let mut config = match file {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::Parse(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(path.to_path_buf(), e))
    }

    /// Applies `LEASEHOLD_*` overrides read through `lookup`.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(id) = lookup("LEASEHOLD_INSTANCE_ID") {
            self.instance_id = id;
        }
        self.engine.apply_overrides(&lookup);
        self.metrics.apply_overrides(&lookup);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.instance_id.trim().is_empty() {
            return Err(ConfigError::Validation("instance_id must not be empty".into()));
        }
        self.engine.validate()
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Entities leased per processor per tick.
    pub batch_size: usize,
    /// Lease validity in milliseconds.
    pub lease_duration_ms: u64,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Same-state retries before an entity is forced to ERROR.
    pub max_retries: u32,
    /// Base of the exponential per-entity retry delay (0 = retry on next tick).
    pub retry_base_delay_ms: u64,
    pub shutdown_timeout_ms: u64,
    /// Bound on each collaborator call; must stay below the lease duration.
    pub collaborator_timeout_ms: u64,
    /// Command save attempts before a conflict is surfaced.
    pub command_max_attempts: u32,
    pub command_queue_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size: 5,
            lease_duration_ms: 60_000,
            min_backoff_ms: 500,
            max_backoff_ms: 10_000,
            max_retries: 7,
            retry_base_delay_ms: 0,
            shutdown_timeout_ms: 10_000,
            collaborator_timeout_ms: 30_000,
            command_max_attempts: 3,
            command_queue_capacity: 256,
        }
    }
}

impl EngineConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        fn parse<T: std::str::FromStr>(
            lookup: &impl Fn(&str) -> Option<String>,
            key: &str,
            target: &mut T,
        ) {
            if let Some(value) = lookup(key) {
                match value.parse() {
                    Ok(parsed) => *target = parsed,
                    Err(_) => tracing::warn!(key, value = %value, "ignoring unparsable override"),
                }
            }
        }

        parse(lookup, "LEASEHOLD_BATCH_SIZE", &mut self.batch_size);
        parse(lookup, "LEASEHOLD_LEASE_DURATION_MS", &mut self.lease_duration_ms);
        parse(lookup, "LEASEHOLD_MIN_BACKOFF_MS", &mut self.min_backoff_ms);
        parse(lookup, "LEASEHOLD_MAX_BACKOFF_MS", &mut self.max_backoff_ms);
        parse(lookup, "LEASEHOLD_MAX_RETRIES", &mut self.max_retries);
        parse(lookup, "LEASEHOLD_RETRY_BASE_DELAY_MS", &mut self.retry_base_delay_ms);
        parse(lookup, "LEASEHOLD_SHUTDOWN_TIMEOUT_MS", &mut self.shutdown_timeout_ms);
        parse(lookup, "LEASEHOLD_COLLABORATOR_TIMEOUT_MS", &mut self.collaborator_timeout_ms);
        parse(lookup, "LEASEHOLD_COMMAND_MAX_ATTEMPTS", &mut self.command_max_attempts);
        parse(lookup, "LEASEHOLD_COMMAND_QUEUE_CAPACITY", &mut self.command_queue_capacity);
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::Validation("engine.batch_size must be greater than 0".into()));
        }
        if self.min_backoff_ms > self.max_backoff_ms {
            return Err(ConfigError::Validation(format!(
                "engine.min_backoff_ms ({}) exceeds engine.max_backoff_ms ({})",
                self.min_backoff_ms, self.max_backoff_ms
            )));
        }
        if self.collaborator_timeout_ms >= self.lease_duration_ms {
            return Err(ConfigError::Validation(format!(
                "engine.collaborator_timeout_ms ({}) must be below engine.lease_duration_ms ({})",
                self.collaborator_timeout_ms, self.lease_duration_ms
            )));
        }
        if self.command_queue_capacity == 0 {
            return Err(ConfigError::Validation(
                "engine.command_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.command_max_attempts == 0 {
            return Err(ConfigError::Validation(
                "engine.command_max_attempts must be greater than 0".into(),
            ));
        }
        Ok(())
    }

    pub fn min_backoff(&self) -> Duration {
        Duration::from_millis(self.min_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Enable metrics HTTP server.
    pub enabled: bool,
    /// Address to bind the metrics server to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9090)),
        }
    }
}

impl MetricsConfig {
    fn apply_overrides(&mut self, lookup: &impl Fn(&str) -> Option<String>) {
        if let Some(enabled) = lookup("LEASEHOLD_METRICS_ENABLED") {
            self.enabled = enabled == "1" || enabled.eq_ignore_ascii_case("true");
        }
        if let Some(addr) = lookup("LEASEHOLD_METRICS_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Configuration error.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {err}", path = .0.display(), err = .1)]
    Io(PathBuf, #[source] std::io::Error),

    #[error("failed to parse config file '{path}': {message}", path = .0.display(), message = .1)]
    Parse(PathBuf, String),

    #[error("configuration validation failed: {0}")]
    Validation(String),
}

/// SocketAddr as a plain string in YAML.
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
