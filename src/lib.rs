pub mod alarm;
pub mod collector;
pub mod config;
pub mod notify;
pub mod rules;
pub mod scheduler;
pub mod storage;
pub mod task;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A monitored device in the facility (server, switch, UPS/PDU, CRAC unit,
/// environmental sensor).
///
/// Devices are owned by the device registry; the engine treats them as
/// immutable for the duration of a poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    pub id: i64,
    /// Facility asset code (e.g. "SW-A01-03")
    pub code: String,
    pub name: String,
    /// Device type used for monitor-config lookup (e.g. "SWITCH", "UPS")
    pub device_type: String,
    /// Protocol name used for collector lookup (e.g. "http", "snmp")
    pub protocol: String,
    pub room_id: Option<i64>,
    pub address: String,
    pub port: u16,
    /// Optional shared secret passed to the device endpoint
    pub token: Option<String>,
}

impl Device {
    /// Display name for logging: falls back to "code (address:port)".
    pub fn display(&self) -> String {
        if self.name.is_empty() {
            format!("{} ({}:{})", self.code, self.address, self.port)
        } else {
            self.name.clone()
        }
    }
}

/// Severity assigned to a metric reading by the collector or rule engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricStatus {
    Normal,
    Warning,
    Critical,
}

/// One normalized metric reading produced by a collector.
///
/// Collectors of every protocol return this shape; the rule engine consumes
/// it once, then it is handed to the metric store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metric {
    pub device_id: i64,
    pub device_type: String,
    pub room_id: Option<i64>,
    /// Metric type matched against rule `alert_type` (e.g. "temperature")
    pub metric_type: String,
    pub value: f64,
    pub unit: String,
    pub collected_at: DateTime<Utc>,
    pub status: MetricStatus,
}

/// Illegal state-machine transition on a task or alarm.
///
/// Returned synchronously to the caller of the mutating operation; the
/// entity's state is left unchanged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateError {
    pub entity: &'static str,
    pub from: String,
    pub to: String,
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "illegal {} transition: {} -> {}",
            self.entity, self.from, self.to
        )
    }
}

impl std::error::Error for StateError {}

impl Metric {
    pub fn new(device: &Device, metric_type: impl Into<String>, value: f64, unit: impl Into<String>) -> Self {
        Self {
            device_id: device.id,
            device_type: device.device_type.clone(),
            room_id: device.room_id,
            metric_type: metric_type.into(),
            value,
            unit: unit.into(),
            collected_at: Utc::now(),
            status: MetricStatus::Normal,
        }
    }
}
