//! TOML configuration for the engine and the daemon
//!
//! Every tunable of the stream engine is read from here; the engine itself
//! never hard-codes a timing or threshold. Durations are integer milliseconds.
//!
//! ```toml
//! [health]
//! pause-on-failure-ms = 30000
//! recovery-probe-interval-ms = 5000
//!
//! [retry]
//! sweep-interval-ms = 60000
//! min-idle-ms = 300000
//! max-delivery-count = 3
//! dead-letter-channel = "stream:dead-letter"
//!
//! [[tap]]
//! channel = "posts"
//! group = "audit"
//! event-types = ["post.created", "post.deleted"]
//! ```

use crate::core::error_handling::ContextualError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

const DEFAULT_CONFIG_DIR: &str = "streamgate";
const DEFAULT_CONFIG_FILE: &str = "streamgate.toml";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file does not exist: {}", path.display())]
    Missing { path: PathBuf },

    #[error("Error reading configuration file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Error parsing configuration file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Invalid configuration value for '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ConfigError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

impl ContextualError for ConfigError {
    fn is_user_actionable(&self) -> bool {
        true
    }

    fn user_message(&self) -> Option<&str> {
        match self {
            ConfigError::Invalid { reason, .. } => Some(reason.as_str()),
            _ => None,
        }
    }
}

/// Circuit-breaker timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthSettings {
    /// Cooldown after the first broker-unreachable failure
    pub pause_on_failure_ms: u64,
    /// Cooldown after a failed probe
    pub recovery_probe_interval_ms: u64,
    /// Longest single sleep while waiting for a probe, so state changes are seen promptly
    pub max_wait_slice_ms: u64,
}

impl Default for HealthSettings {
    fn default() -> Self {
        Self {
            pause_on_failure_ms: 30_000,
            recovery_probe_interval_ms: 5_000,
            max_wait_slice_ms: 1_000,
        }
    }
}

/// Read loop timings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct ReadSettings {
    pub block_ms: u64,
    pub idle_sleep_ms: u64,
    pub error_retry_delay_ms: u64,
    pub nogroup_retry_delay_ms: u64,
    /// Consumer names are `<prefix>-<random>`
    pub consumer_prefix: String,
}

impl Default for ReadSettings {
    fn default() -> Self {
        Self {
            block_ms: 2_000,
            idle_sleep_ms: 100,
            error_retry_delay_ms: 1_000,
            nogroup_retry_delay_ms: 500,
            consumer_prefix: "streamgate".to_string(),
        }
    }
}

/// Reclaim sweep and dead-letter policy
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct RetrySettings {
    pub sweep_interval_ms: u64,
    /// Entries idle for less than this are still owned by a live consumer
    pub min_idle_ms: u64,
    /// Entries delivered more often than this are dead-lettered
    pub max_delivery_count: u64,
    pub fetch_count: usize,
    pub dead_letter_channel: String,
    pub retrier_consumer: String,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            sweep_interval_ms: 60_000,
            min_idle_ms: 300_000,
            max_delivery_count: 3,
            fetch_count: 100,
            dead_letter_channel: "stream:dead-letter".to_string(),
            retrier_consumer: "retrier".to_string(),
        }
    }
}

/// Initial consumer-group creation at engine start
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StartupSettings {
    pub ensure_attempts: usize,
    pub ensure_retry_delay_ms: u64,
}

impl Default for StartupSettings {
    fn default() -> Self {
        Self {
            ensure_attempts: 3,
            ensure_retry_delay_ms: 500,
        }
    }
}

/// Everything the stream engine needs at runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct EngineConfig {
    pub health: HealthSettings,
    pub read: ReadSettings,
    pub retry: RetrySettings,
    pub startup: StartupSettings,
}

impl EngineConfig {
    pub fn pause_on_failure(&self) -> Duration {
        Duration::from_millis(self.health.pause_on_failure_ms)
    }

    pub fn recovery_probe_interval(&self) -> Duration {
        Duration::from_millis(self.health.recovery_probe_interval_ms)
    }

    pub fn max_wait_slice(&self) -> Duration {
        Duration::from_millis(self.health.max_wait_slice_ms)
    }

    pub fn read_block(&self) -> Duration {
        Duration::from_millis(self.read.block_ms)
    }

    pub fn idle_sleep(&self) -> Duration {
        Duration::from_millis(self.read.idle_sleep_ms)
    }

    pub fn error_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read.error_retry_delay_ms)
    }

    pub fn nogroup_retry_delay(&self) -> Duration {
        Duration::from_millis(self.read.nogroup_retry_delay_ms)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.retry.sweep_interval_ms)
    }

    pub fn min_idle(&self) -> Duration {
        Duration::from_millis(self.retry.min_idle_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("health.pause-on-failure-ms", self.health.pause_on_failure_ms),
            (
                "health.recovery-probe-interval-ms",
                self.health.recovery_probe_interval_ms,
            ),
            ("health.max-wait-slice-ms", self.health.max_wait_slice_ms),
            ("read.idle-sleep-ms", self.read.idle_sleep_ms),
            ("read.error-retry-delay-ms", self.read.error_retry_delay_ms),
            ("read.nogroup-retry-delay-ms", self.read.nogroup_retry_delay_ms),
            ("retry.sweep-interval-ms", self.retry.sweep_interval_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::invalid(
                    field,
                    format!("{field} must be greater than 0"),
                ));
            }
        }

        if self.retry.fetch_count == 0 {
            return Err(ConfigError::invalid(
                "retry.fetch-count",
                "retry.fetch-count must be greater than 0",
            ));
        }
        if self.retry.dead_letter_channel.trim().is_empty() {
            return Err(ConfigError::invalid(
                "retry.dead-letter-channel",
                "retry.dead-letter-channel must not be blank",
            ));
        }
        if self.retry.retrier_consumer.trim().is_empty() {
            return Err(ConfigError::invalid(
                "retry.retrier-consumer",
                "retry.retrier-consumer must not be blank",
            ));
        }
        if self.read.consumer_prefix.trim().is_empty() {
            return Err(ConfigError::invalid(
                "read.consumer-prefix",
                "read.consumer-prefix must not be blank",
            ));
        }
        if self.startup.ensure_attempts == 0 {
            return Err(ConfigError::invalid(
                "startup.ensure-attempts",
                "startup.ensure-attempts must be at least 1",
            ));
        }

        if self.health.recovery_probe_interval_ms > self.health.pause_on_failure_ms {
            log::warn!(
                "health.recovery-probe-interval-ms ({}) exceeds health.pause-on-failure-ms ({}); \
                 probes after the first failure will back off further than the initial pause",
                self.health.recovery_probe_interval_ms,
                self.health.pause_on_failure_ms
            );
        }

        Ok(())
    }
}

/// Logging destination and format
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LogSettings {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,
    /// `text`, `ext` or `json`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
}

/// A subscription the daemon taps and logs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct TapSettings {
    pub channel: String,
    pub group: String,
    pub event_types: Vec<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_true")]
    pub blocking: bool,
    #[serde(default)]
    pub sequential: bool,
    #[serde(default)]
    pub ack_on_failure: bool,
}

fn default_batch_size() -> usize {
    10
}

fn default_true() -> bool {
    true
}

/// Periodic self-published event so a fresh daemon has traffic to show
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct HeartbeatSettings {
    pub channel: String,
    pub interval_ms: u64,
}

/// Top-level daemon configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct DaemonConfig {
    #[serde(flatten)]
    pub engine: EngineConfig,
    pub logging: LogSettings,
    pub tap: Vec<TapSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat: Option<HeartbeatSettings>,
}

impl DaemonConfig {
    /// Parse and validate configuration text
    pub fn from_toml_str(contents: &str, origin: &Path) -> Result<Self, ConfigError> {
        let config: DaemonConfig =
            toml::from_str(contents).map_err(|source| ConfigError::Parse {
                path: origin.to_path_buf(),
                source,
            })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.engine.validate()?;
        for (index, tap) in self.tap.iter().enumerate() {
            if tap.event_types.is_empty() {
                return Err(ConfigError::invalid(
                    &format!("tap[{index}].event-types"),
                    format!(
                        "tap on channel '{}' must list at least one event type",
                        tap.channel
                    ),
                ));
            }
        }
        if let Some(heartbeat) = &self.heartbeat {
            if heartbeat.interval_ms == 0 {
                return Err(ConfigError::invalid(
                    "heartbeat.interval-ms",
                    "heartbeat.interval-ms must be greater than 0",
                ));
            }
        }
        Ok(())
    }

    /// Load configuration from an explicit file or the default location
    ///
    /// An explicit path must exist. Without one, the default
    /// `<config dir>/streamgate/streamgate.toml` is used if present, and
    /// built-in defaults otherwise.
    pub async fn load(config_file: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config_path = match config_file {
            Some(path) if !path.exists() => return Err(ConfigError::Missing { path }),
            Some(path) => Some(path),
            None => default_config_path().filter(|path| path.exists()),
        };

        match config_path {
            Some(path) => {
                log::debug!("Loading configuration from {}", path.display());
                let contents = tokio::fs::read_to_string(&path)
                    .await
                    .map_err(|source| ConfigError::Read {
                        path: path.clone(),
                        source,
                    })?;
                Self::from_toml_str(&contents, &path)
            }
            None => {
                log::debug!("No configuration file found; using defaults");
                Ok(Self::default())
            }
        }
    }
}

fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join(DEFAULT_CONFIG_DIR).join(DEFAULT_CONFIG_FILE))
}
