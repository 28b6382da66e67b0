//! Collaborator trait definitions
//!
//! The engine consumes the rest of the system (device inventory, monitor
//! policies, history persistence) exclusively through these traits. All
//! implementations must be `Send + Sync` since they are shared across the
//! scheduler's worker tasks.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::error::StorageResult;
use crate::alarm::AlarmRecord;
use crate::config::MonitorConfig;
use crate::task::MonitorTask;
use crate::{Device, Metric};

/// Filter for device listing; `None` fields match everything
#[derive(Debug, Clone, Default)]
pub struct DeviceFilter {
    pub device_type: Option<String>,
    pub room_id: Option<i64>,
}

impl DeviceFilter {
    pub fn by_type(device_type: impl Into<String>) -> Self {
        Self {
            device_type: Some(device_type.into()),
            room_id: None,
        }
    }

    pub fn by_room(room_id: i64) -> Self {
        Self {
            device_type: None,
            room_id: Some(room_id),
        }
    }

    pub fn matches(&self, device: &Device) -> bool {
        if self
            .device_type
            .as_ref()
            .is_some_and(|t| *t != device.device_type)
        {
            return false;
        }
        if self.room_id.is_some() && self.room_id != device.room_id {
            return false;
        }
        true
    }
}

/// Device inventory, owned by the external device-registry service
#[async_trait]
pub trait DeviceRegistry: Send + Sync {
    async fn list_devices(&self, filter: &DeviceFilter) -> StorageResult<Vec<Device>>;
    async fn get_device(&self, id: i64) -> StorageResult<Option<Device>>;
}

/// Per device-type monitor policies
///
/// Writes validate the config before accepting it; invalid bounds are
/// rejected here, never at poll time.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn get_monitor_config(&self, device_type: &str) -> StorageResult<Option<MonitorConfig>>;
    async fn list_enabled_configs(&self) -> StorageResult<Vec<MonitorConfig>>;
    async fn put_monitor_config(&self, config: MonitorConfig) -> StorageResult<()>;
}

/// Metric history persistence
#[async_trait]
pub trait MetricStore: Send + Sync {
    /// Persist a batch of collected metrics
    async fn save_metrics(&self, metrics: &[Metric]) -> StorageResult<()>;

    /// The N most recent metrics for a device, oldest first
    async fn query_latest(&self, device_id: i64, limit: usize) -> StorageResult<Vec<Metric>>;

    /// Metrics for a device within a time range (inclusive), oldest first
    async fn query_range(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>>;

    /// Retention: delete metrics older than `before`; returns rows removed
    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize>;
}

/// Alarm persistence
///
/// Alarms are never deleted; `Closed` is the terminal soft state.
#[async_trait]
pub trait AlarmStore: Send + Sync {
    /// Persist a new alarm; allocates and returns its id
    async fn insert(&self, alarm: AlarmRecord) -> StorageResult<i64>;

    async fn get(&self, id: i64) -> StorageResult<Option<AlarmRecord>>;

    /// Persist the full current state of an existing alarm
    async fn update(&self, alarm: &AlarmRecord) -> StorageResult<()>;

    /// All alarms not yet resolved or closed
    async fn list_open(&self) -> StorageResult<Vec<AlarmRecord>>;

    /// Alarms created within a time range, oldest first
    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AlarmRecord>>;
}

/// Terminal-task archive (optional persistence behind the in-memory tracker)
#[async_trait]
pub trait TaskArchive: Send + Sync {
    async fn archive_tasks(&self, tasks: &[MonitorTask]) -> StorageResult<()>;

    async fn query_tasks_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MonitorTask>>;

    /// Retention: delete archived tasks that ended before `before`
    async fn cleanup_old_tasks(&self, before: DateTime<Utc>) -> StorageResult<usize>;
}
