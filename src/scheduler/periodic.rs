//! Periodic collection orchestrator
//!
//! Drives the scheduler from a one-second ticker. Each enabled monitor config
//! has its own collection interval; on every tick, device types whose interval
//! has elapsed get a full batch dispatch. Devices that failed get retried on
//! the very next ticks, at most `max_retries` times per interval; after that
//! they wait for the next full batch.
//!
//! The orchestrator also runs maintenance on a fixed cadence: metric and task
//! retention purges, task archiving and notification retry rounds.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::{BatchSummary, Scheduler};
use crate::Device;
use crate::alarm::AlarmLifecycle;
use crate::config::MonitorConfig;
use crate::storage::{ConfigStore, DeviceFilter, DeviceRegistry, MetricStore, TaskArchive};
use crate::task::TaskStatus;

/// How long collected history is kept
#[derive(Debug, Clone, Copy)]
pub struct Retention {
    pub metric_days: u32,
    pub task_days: u32,
}

impl Default for Retention {
    fn default() -> Self {
        Self {
            metric_days: 30,
            task_days: 30,
        }
    }
}

/// Periodic driver for the scheduler
pub struct Orchestrator {
    scheduler: Arc<Scheduler>,
    devices: Arc<dyn DeviceRegistry>,
    configs: Arc<dyn ConfigStore>,
    alarms: Arc<AlarmLifecycle>,
    metrics: Arc<dyn MetricStore>,
    archive: Option<Arc<dyn TaskArchive>>,
    retention: Retention,
    maintenance_every: Duration,
    cancel: watch::Receiver<bool>,

    /// When each device type last had a full batch
    last_run: HashMap<String, DateTime<Utc>>,
    last_maintenance: DateTime<Utc>,

    /// Failed devices awaiting a retry tick, per device type; the u32 is the
    /// attempt number the next dispatch will carry
    retry_queue: HashMap<String, HashMap<i64, (Device, u32)>>,
}

impl Orchestrator {
    pub fn new(
        scheduler: Arc<Scheduler>,
        devices: Arc<dyn DeviceRegistry>,
        configs: Arc<dyn ConfigStore>,
        alarms: Arc<AlarmLifecycle>,
        metrics: Arc<dyn MetricStore>,
        archive: Option<Arc<dyn TaskArchive>>,
        retention: Retention,
    ) -> Self {
        let cancel = scheduler.cancel_signal();
        Self {
            scheduler,
            devices,
            configs,
            alarms,
            metrics,
            archive,
            retention,
            maintenance_every: Duration::hours(1),
            cancel,
            last_run: HashMap::new(),
            last_maintenance: Utc::now(),
            retry_queue: HashMap::new(),
        }
    }

    /// Run until the scheduler is cancelled.
    pub async fn run(mut self) {
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut cancel = self.cancel.clone();

        info!("periodic orchestrator started");
        loop {
            // the watch guard must not live across the tick await below, so
            // the cancel arm resolves to a plain unit
            let cancelled = tokio::select! {
                _ = ticker.tick() => false,
                _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => true,
            };
            if cancelled {
                break;
            }
            if let Err(e) = self.tick(Utc::now()).await {
                warn!("tick failed: {e}");
            }
        }
        info!("periodic orchestrator stopped");
    }

    /// One scheduling step at time `now`: dispatch due device types, retry
    /// recent failures, run maintenance when its cadence elapses.
    pub async fn tick(&mut self, now: DateTime<Utc>) -> anyhow::Result<()> {
        let configs = self.configs.list_enabled_configs().await?;

        for config in configs {
            let interval = Duration::seconds(config.interval_secs as i64);
            let due = self
                .last_run
                .get(&config.device_type)
                .is_none_or(|last| now - *last >= interval);

            if due {
                self.last_run.insert(config.device_type.clone(), now);
                // a fresh interval starts with a clean retry slate
                self.retry_queue.remove(&config.device_type);

                let devices = self
                    .devices
                    .list_devices(&DeviceFilter::by_type(&config.device_type))
                    .await?;
                if devices.is_empty() {
                    continue;
                }

                debug!(
                    "interval elapsed for {}, polling {} devices",
                    config.device_type,
                    devices.len()
                );
                let batch = devices.into_iter().map(|d| (d, 0)).collect();
                self.dispatch(&config, batch).await;
            } else if let Some(pending) = self.retry_queue.remove(&config.device_type) {
                let batch: Vec<(Device, u32)> = pending.into_values().collect();
                debug!(
                    "retrying {} failed devices of type {}",
                    batch.len(),
                    config.device_type
                );
                self.dispatch(&config, batch).await;
            }
        }

        if now - self.last_maintenance >= self.maintenance_every {
            self.last_maintenance = now;
            self.maintenance(now).await;
        }

        Ok(())
    }

    /// Dispatch a set of (device, attempt) polls and queue failures for retry
    async fn dispatch(&mut self, config: &MonitorConfig, batch: Vec<(Device, u32)>) {
        let scheduler = self.scheduler.clone();
        let results = futures::future::join_all(batch.into_iter().map(|(device, attempt)| {
            let scheduler = scheduler.clone();
            let config = config.clone();
            async move {
                let result = scheduler.collect_device(device.clone(), &config, attempt).await;
                (device, attempt, result)
            }
        }))
        .await;

        for (device, attempt, result) in results {
            if result.task.status == TaskStatus::Success {
                continue;
            }

            if attempt < config.max_retries {
                self.retry_queue
                    .entry(config.device_type.clone())
                    .or_default()
                    .insert(device.id, (device, attempt + 1));
            } else if config.max_retries > 0 {
                warn!(
                    "device {} still failing after {} retries, waiting for next interval",
                    device.display(),
                    config.max_retries
                );
            }
        }
    }

    /// Retention purges, task archiving and notification retry
    #[instrument(skip(self))]
    pub async fn maintenance(&self, now: DateTime<Utc>) {
        let metric_cutoff = now - Duration::days(self.retention.metric_days as i64);
        if let Err(e) = self.metrics.cleanup_old_metrics(metric_cutoff).await {
            warn!("metric retention purge failed: {e}");
        }

        let task_cutoff = now - Duration::days(self.retention.task_days as i64);
        if let Some(archive) = &self.archive {
            let terminal = self.scheduler.tracker().completed_tasks();
            if let Err(e) = archive.archive_tasks(&terminal).await {
                warn!("task archiving failed: {e}");
            }
            if let Err(e) = archive.cleanup_old_tasks(task_cutoff).await {
                warn!("task archive purge failed: {e}");
            }
        }
        self.scheduler.tracker().purge_completed_before(task_cutoff);

        if let Err(e) = self.alarms.retry_unsent().await {
            warn!("notification retry round failed: {e}");
        }
    }

    /// Poll every device of every enabled device type once, immediately.
    pub async fn collect_all(&self) -> anyhow::Result<Vec<(String, BatchSummary)>> {
        let configs = self.configs.list_enabled_configs().await?;
        let mut summaries = Vec::with_capacity(configs.len());

        for config in configs {
            let devices = self
                .devices
                .list_devices(&DeviceFilter::by_type(&config.device_type))
                .await?;
            let summary = self.scheduler.collect_batch(devices, &config).await;
            summaries.push((config.device_type, summary));
        }

        Ok(summaries)
    }

    /// Poll every device in one room once, immediately. Devices whose type has
    /// no enabled monitor config are skipped.
    pub async fn collect_room(&self, room_id: i64) -> anyhow::Result<BatchSummary> {
        let devices = self
            .devices
            .list_devices(&DeviceFilter::by_room(room_id))
            .await?;

        let mut by_type: HashMap<String, Vec<Device>> = HashMap::new();
        for device in devices {
            by_type.entry(device.device_type.clone()).or_default().push(device);
        }

        let mut combined = BatchSummary::default();
        for (device_type, devices) in by_type {
            match self.configs.get_monitor_config(&device_type).await? {
                Some(config) if config.enabled => {
                    combined.merge(&self.scheduler.collect_batch(devices, &config).await);
                }
                _ => {
                    warn!(
                        "no enabled monitor config for device type {device_type}, skipping {} devices",
                        devices.len()
                    );
                }
            }
        }

        Ok(combined)
    }
}
