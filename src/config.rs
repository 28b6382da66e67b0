use std::fmt;
use std::path::PathBuf;

use serde::Deserialize;
use tracing::trace;

use crate::Device;

/// Storage backend configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory history only (no persistence)
    #[serde(rename = "none")]
    None,

    /// SQLite database (default for most deployments)
    Sqlite {
        /// Path to the SQLite database file
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,

        /// Retention period in days (history older than this is purged)
        #[serde(default = "default_retention_days")]
        retention_days: u32,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
            retention_days: default_retention_days(),
        }
    }
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./fleetwatch.db")
}

fn default_retention_days() -> u32 {
    30
}

/// What the dispatcher does when the poll queue is full.
///
/// `CallerRuns` executes the task on the dispatching task itself instead of
/// dropping it, which throttles the producer without losing polls.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    Block,
    #[default]
    CallerRuns,
    Drop,
}

/// Worker pool tuning for the scheduler
#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "default_workers")]
    pub workers: usize,

    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    #[serde(default)]
    pub overflow: OverflowPolicy,

    /// How many slowest devices to keep in the statistics snapshot
    #[serde(default = "default_slow_sample")]
    pub slow_sample: usize,

    /// Terminal tasks older than this many days are purged by maintenance
    #[serde(default = "default_task_retention_days")]
    pub task_retention_days: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            overflow: OverflowPolicy::default(),
            slow_sample: default_slow_sample(),
            task_retention_days: default_task_retention_days(),
        }
    }
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    64
}

fn default_slow_sample() -> usize {
    10
}

fn default_task_retention_days() -> u32 {
    30
}

/// Per device-type polling policy
#[derive(Debug, Clone, Deserialize)]
pub struct MonitorConfig {
    /// Device type this policy applies to (e.g. "SWITCH")
    pub device_type: String,

    /// Collector protocol name (e.g. "http", "snmp")
    pub protocol: String,

    /// Collection interval in seconds, must be within [1, 86400]
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Per-poll timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Upper bound on concurrent polls for this device type
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Failed devices are retried on subsequent ticks, at most this many times
    /// per interval
    #[serde(default)]
    pub max_retries: u32,

    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Protocol-specific parameters, passed through to the collector
    #[serde(default)]
    pub params: serde_json::Value,
}

const MIN_INTERVAL_SECS: u64 = 1;
const MAX_INTERVAL_SECS: u64 = 86_400;

impl MonitorConfig {
    /// Validate bounds. Called at config load/write time, never at poll time.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.interval_secs < MIN_INTERVAL_SECS || self.interval_secs > MAX_INTERVAL_SECS {
            return Err(ConfigError::InvalidInterval {
                device_type: self.device_type.clone(),
                interval_secs: self.interval_secs,
            });
        }
        if self.timeout_secs == 0 {
            return Err(ConfigError::InvalidTimeout {
                device_type: self.device_type.clone(),
            });
        }
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidConcurrency {
                device_type: self.device_type.clone(),
            });
        }
        Ok(())
    }
}

fn default_interval() -> u64 {
    60
}

fn default_timeout() -> u64 {
    10
}

fn default_concurrency() -> usize {
    4
}

fn default_enabled() -> bool {
    true
}

/// DingTalk webhook settings
#[derive(Debug, Clone, Deserialize)]
pub struct DingTalkConfig {
    pub url: String,
    /// Optional keyword the webhook requires in every message
    pub keyword: Option<String>,
}

/// Notification channel settings
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotifyConfig {
    pub dingtalk: Option<DingTalkConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Static device inventory (optional; deployments with a real registry
    /// leave this empty)
    pub devices: Option<Vec<Device>>,

    pub monitors: Option<Vec<MonitorConfig>>,

    /// Alert rules loaded at startup; rule sets can be swapped at runtime
    pub rules: Option<Vec<crate::rules::AlertRule>>,

    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Storage configuration (optional - defaults to in-memory)
    pub storage: Option<StorageConfig>,

    #[serde(default)]
    pub notify: NotifyConfig,
}

/// Errors rejected at configuration-write time
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    InvalidInterval { device_type: String, interval_secs: u64 },
    InvalidTimeout { device_type: String },
    InvalidConcurrency { device_type: String },
    DuplicateDeviceType(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidInterval {
                device_type,
                interval_secs,
            } => write!(
                f,
                "invalid interval {interval_secs}s for device type {device_type} (must be 1..=86400)"
            ),
            ConfigError::InvalidTimeout { device_type } => {
                write!(f, "timeout for device type {device_type} must be at least 1s")
            }
            ConfigError::InvalidConcurrency { device_type } => {
                write!(f, "concurrency for device type {device_type} must be at least 1")
            }
            ConfigError::DuplicateDeviceType(device_type) => {
                write!(f, "more than one monitor config for device type {device_type}")
            }
        }
    }
}

impl std::error::Error for ConfigError {}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    let config: Config = serde_json::from_str(&file_content)
        .map_err(|_| anyhow::anyhow!("Invalid configuration file provided!"))?;

    if let Some(monitors) = &config.monitors {
        let mut seen = std::collections::HashSet::new();
        for monitor in monitors {
            monitor.validate()?;
            if !seen.insert(monitor.device_type.clone()) {
                return Err(ConfigError::DuplicateDeviceType(monitor.device_type.clone()).into());
            }
        }
    }

    trace!("loaded config: {config:?}");
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn monitor(device_type: &str) -> MonitorConfig {
        MonitorConfig {
            device_type: device_type.to_string(),
            protocol: "http".to_string(),
            interval_secs: 60,
            timeout_secs: 10,
            concurrency: 4,
            max_retries: 3,
            enabled: true,
            params: serde_json::Value::Null,
        }
    }

    #[test]
    fn valid_monitor_config_passes() {
        assert!(monitor("SWITCH").validate().is_ok());
    }

    #[test]
    fn interval_bounds_rejected() {
        let mut cfg = monitor("SWITCH");
        cfg.interval_secs = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidInterval { .. })
        ));

        cfg.interval_secs = 86_401;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidInterval { .. })
        ));

        cfg.interval_secs = 86_400;
        assert!(cfg.validate().is_ok());
        cfg.interval_secs = 1;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn zero_concurrency_rejected() {
        let mut cfg = monitor("UPS");
        cfg.concurrency = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidConcurrency { .. })
        ));
    }

    #[test]
    fn zero_timeout_rejected() {
        let mut cfg = monitor("UPS");
        cfg.timeout_secs = 0;
        assert!(matches!(
            cfg.validate(),
            Err(ConfigError::InvalidTimeout { .. })
        ));
    }

    #[test]
    fn overflow_policy_deserializes_snake_case() {
        let policy: OverflowPolicy = serde_json::from_str("\"caller_runs\"").unwrap();
        assert_eq!(policy, OverflowPolicy::CallerRuns);
        let policy: OverflowPolicy = serde_json::from_str("\"drop\"").unwrap();
        assert_eq!(policy, OverflowPolicy::Drop);
    }
}
