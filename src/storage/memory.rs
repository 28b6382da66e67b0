//! In-memory collaborator implementations (no persistence)
//!
//! These back the engine when no external services are wired up:
//! - standalone deployments driven purely by the config file
//! - tests that need a registry/store without database dependencies
//!
//! Metric history is a per-device ring buffer with a fixed capacity; when the
//! buffer is full, oldest readings are evicted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicI64, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::error::{StorageError, StorageResult};
use super::traits::{
    AlarmStore, ConfigStore, DeviceFilter, DeviceRegistry, MetricStore, TaskArchive,
};
use crate::alarm::{AlarmRecord, AlarmStatus};
use crate::config::MonitorConfig;
use crate::task::MonitorTask;
use crate::{Device, Metric};

/// Maximum metrics to keep in memory per device
const MAX_METRICS_PER_DEVICE: usize = 1000;

/// Device inventory held in memory, seeded from the config file
#[derive(Default)]
pub struct MemoryDeviceRegistry {
    devices: RwLock<Vec<Device>>,
}

impl MemoryDeviceRegistry {
    pub fn new(devices: Vec<Device>) -> Self {
        Self {
            devices: RwLock::new(devices),
        }
    }

    pub async fn add(&self, device: Device) {
        self.devices.write().await.push(device);
    }
}

#[async_trait]
impl DeviceRegistry for MemoryDeviceRegistry {
    async fn list_devices(&self, filter: &DeviceFilter) -> StorageResult<Vec<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .filter(|d| filter.matches(d))
            .cloned()
            .collect())
    }

    async fn get_device(&self, id: i64) -> StorageResult<Option<Device>> {
        Ok(self
            .devices
            .read()
            .await
            .iter()
            .find(|d| d.id == id)
            .cloned())
    }
}

/// Monitor policies held in memory, keyed by device type
#[derive(Default)]
pub struct MemoryConfigStore {
    configs: RwLock<HashMap<String, MonitorConfig>>,
}

impl MemoryConfigStore {
    pub fn new(configs: Vec<MonitorConfig>) -> Self {
        let map = configs
            .into_iter()
            .map(|c| (c.device_type.clone(), c))
            .collect();
        Self {
            configs: RwLock::new(map),
        }
    }
}

#[async_trait]
impl ConfigStore for MemoryConfigStore {
    async fn get_monitor_config(&self, device_type: &str) -> StorageResult<Option<MonitorConfig>> {
        Ok(self.configs.read().await.get(device_type).cloned())
    }

    async fn list_enabled_configs(&self) -> StorageResult<Vec<MonitorConfig>> {
        Ok(self
            .configs
            .read()
            .await
            .values()
            .filter(|c| c.enabled)
            .cloned()
            .collect())
    }

    async fn put_monitor_config(&self, config: MonitorConfig) -> StorageResult<()> {
        // bounds are rejected at write time, never at poll time
        config
            .validate()
            .map_err(|e| StorageError::InvalidConfig(e.to_string()))?;
        self.configs
            .write()
            .await
            .insert(config.device_type.clone(), config);
        Ok(())
    }
}

/// Ring-buffered metric history
#[derive(Default)]
pub struct MemoryMetricStore {
    metrics: RwLock<HashMap<i64, VecDeque<Metric>>>,
}

impl MemoryMetricStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricStore for MemoryMetricStore {
    async fn save_metrics(&self, metrics: &[Metric]) -> StorageResult<()> {
        let mut map = self.metrics.write().await;
        for metric in metrics {
            let buffer = map.entry(metric.device_id).or_default();
            if buffer.len() == MAX_METRICS_PER_DEVICE {
                buffer.pop_front();
            }
            buffer.push_back(metric.clone());
        }
        Ok(())
    }

    async fn query_latest(&self, device_id: i64, limit: usize) -> StorageResult<Vec<Metric>> {
        let mut metrics: Vec<Metric> = self
            .metrics
            .read()
            .await
            .get(&device_id)
            .map(|buffer| buffer.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default();
        metrics.reverse();
        Ok(metrics)
    }

    async fn query_range(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>> {
        Ok(self
            .metrics
            .read()
            .await
            .get(&device_id)
            .map(|buffer| {
                buffer
                    .iter()
                    .filter(|m| m.collected_at >= start && m.collected_at <= end)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut map = self.metrics.write().await;
        let mut removed = 0;
        for buffer in map.values_mut() {
            let len_before = buffer.len();
            buffer.retain(|m| m.collected_at >= before);
            removed += len_before - buffer.len();
        }
        if removed > 0 {
            debug!("purged {removed} metrics older than {before}");
        }
        Ok(removed)
    }
}

/// Alarm store held in memory; ids are allocated from a process-local counter
#[derive(Default)]
pub struct MemoryAlarmStore {
    alarms: RwLock<HashMap<i64, AlarmRecord>>,
    next_id: AtomicI64,
}

impl MemoryAlarmStore {
    pub fn new() -> Self {
        Self {
            alarms: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl AlarmStore for MemoryAlarmStore {
    async fn insert(&self, mut alarm: AlarmRecord) -> StorageResult<i64> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        alarm.id = id;
        self.alarms.write().await.insert(id, alarm);
        Ok(id)
    }

    async fn get(&self, id: i64) -> StorageResult<Option<AlarmRecord>> {
        Ok(self.alarms.read().await.get(&id).cloned())
    }

    async fn update(&self, alarm: &AlarmRecord) -> StorageResult<()> {
        let mut map = self.alarms.write().await;
        if !map.contains_key(&alarm.id) {
            return Err(StorageError::NotFound(format!("alarm {}", alarm.id)));
        }
        map.insert(alarm.id, alarm.clone());
        Ok(())
    }

    async fn list_open(&self) -> StorageResult<Vec<AlarmRecord>> {
        let mut open: Vec<AlarmRecord> = self
            .alarms
            .read()
            .await
            .values()
            .filter(|a| matches!(a.status, AlarmStatus::Active | AlarmStatus::Acknowledged))
            .cloned()
            .collect();
        open.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(open)
    }

    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AlarmRecord>> {
        let mut alarms: Vec<AlarmRecord> = self
            .alarms
            .read()
            .await
            .values()
            .filter(|a| a.created_at >= start && a.created_at <= end)
            .cloned()
            .collect();
        alarms.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(alarms)
    }
}

/// Archive of finished monitor tasks
#[derive(Default)]
pub struct MemoryTaskArchive {
    tasks: RwLock<Vec<MonitorTask>>,
}

impl MemoryTaskArchive {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskArchive for MemoryTaskArchive {
    async fn archive_tasks(&self, tasks: &[MonitorTask]) -> StorageResult<()> {
        self.tasks.write().await.extend_from_slice(tasks);
        Ok(())
    }

    async fn query_tasks_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MonitorTask>> {
        Ok(self
            .tasks
            .read()
            .await
            .iter()
            .filter(|t| t.created_at >= start && t.created_at <= end)
            .cloned()
            .collect())
    }

    async fn cleanup_old_tasks(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let mut tasks = self.tasks.write().await;
        let len_before = tasks.len();
        tasks.retain(|t| !t.ended_at.is_some_and(|ended| ended < before));
        Ok(len_before - tasks.len())
    }
}
