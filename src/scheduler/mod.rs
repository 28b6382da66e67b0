//! Collection scheduler and worker pool
//!
//! The scheduler owns a bounded job queue drained by a fixed pool of worker
//! tasks. Each job polls one device through its protocol collector, runs the
//! collected metrics through the rule engine, raises alarms and persists the
//! batch. Outcomes are recorded in the [`TaskTracker`].
//!
//! ## Backpressure
//!
//! The queue is bounded; what happens when it is full is decided by the
//! configured [`OverflowPolicy`]:
//!
//! - `Block`: the dispatcher waits for a slot
//! - `CallerRuns`: the dispatcher executes the poll itself
//! - `Drop`: the task fails immediately and is counted as dropped
//!
//! ## Single-flight
//!
//! At most one poll per device is in flight at any time. A dispatch for a
//! device that is already being polled fails immediately without queueing.

pub mod periodic;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

use crate::Device;
use crate::MetricStatus;
use crate::alarm::AlarmLifecycle;
use crate::collector::CollectorRegistry;
use crate::config::{MonitorConfig, OverflowPolicy, SchedulerConfig};
use crate::rules::AlertRuleEngine;
use crate::storage::MetricStore;
use crate::task::{MonitorTask, TaskOutcome, TaskStatus, TaskTracker};

/// Outcome of one dispatched poll
#[derive(Debug, Clone)]
pub struct TaskResult {
    pub task: MonitorTask,
    /// Alarms raised while processing this poll's metrics
    pub alarms_raised: usize,
    /// Shed by the overflow policy before reaching a worker
    pub dropped: bool,
}

/// Aggregate outcome of one batch dispatch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub total: usize,
    pub success: usize,
    pub failed: usize,
    pub timeout: usize,
    pub dropped: usize,
    pub alarms_raised: usize,
    /// Summed task durations
    pub total_duration_ms: i64,
    /// Wall-clock time the batch took
    pub elapsed_ms: i64,
}

impl BatchSummary {
    pub fn merge(&mut self, other: &BatchSummary) {
        self.total += other.total;
        self.success += other.success;
        self.failed += other.failed;
        self.timeout += other.timeout;
        self.dropped += other.dropped;
        self.alarms_raised += other.alarms_raised;
        self.total_duration_ms += other.total_duration_ms;
        self.elapsed_ms += other.elapsed_ms;
    }

    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.success as f64 / self.total as f64
        }
    }

    pub fn avg_duration_ms(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.total_duration_ms as f64 / self.total as f64
        }
    }

    /// Completed polls per second of batch wall-clock time
    pub fn throughput_per_sec(&self) -> f64 {
        if self.elapsed_ms <= 0 {
            0.0
        } else {
            self.total as f64 / (self.elapsed_ms as f64 / 1000.0)
        }
    }

    fn record(&mut self, result: &TaskResult) {
        self.total += 1;
        self.alarms_raised += result.alarms_raised;
        self.total_duration_ms += result.task.duration_ms.unwrap_or(0).max(0);
        if result.dropped {
            self.dropped += 1;
            return;
        }
        match result.task.status {
            TaskStatus::Success => self.success += 1,
            TaskStatus::Timeout => self.timeout += 1,
            _ => self.failed += 1,
        }
    }
}

/// Snapshot of the scheduler's performance counters
#[derive(Debug, Clone)]
pub struct PerformanceStatistics {
    pub total_tasks: u64,
    pub success: u64,
    pub failed: u64,
    pub timeout: u64,
    pub dropped: u64,
    pub avg_duration_ms: f64,
    /// Slowest recent polls as (device_id, duration_ms), slowest first
    pub slowest: Vec<(i64, i64)>,
    /// Tasks currently in the Running state
    pub running: usize,
    /// Jobs queued but not yet picked up by a worker
    pub queue_depth: usize,
    pub workers: usize,
}

#[derive(Debug, Default)]
struct Stats {
    total: AtomicU64,
    success: AtomicU64,
    failed: AtomicU64,
    timeout: AtomicU64,
    dropped: AtomicU64,
    total_duration_ms: AtomicU64,
    slowest: StdMutex<Vec<(i64, i64)>>,
}

impl Stats {
    fn record(&self, task: &MonitorTask, slow_sample: usize) {
        self.total.fetch_add(1, Ordering::Relaxed);
        match task.status {
            TaskStatus::Success => self.success.fetch_add(1, Ordering::Relaxed),
            TaskStatus::Timeout => self.timeout.fetch_add(1, Ordering::Relaxed),
            _ => self.failed.fetch_add(1, Ordering::Relaxed),
        };

        if let Some(duration) = task.duration_ms {
            self.total_duration_ms
                .fetch_add(duration.max(0) as u64, Ordering::Relaxed);

            let mut slowest = self.slowest.lock().expect("stats lock poisoned");
            slowest.push((task.device_id, duration));
            slowest.sort_by(|a, b| b.1.cmp(&a.1));
            slowest.truncate(slow_sample);
        }
    }

    fn record_dropped(&self) {
        self.total.fetch_add(1, Ordering::Relaxed);
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> PerformanceStatistics {
        let total = self.total.load(Ordering::Relaxed);
        let completed = self.success.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed)
            + self.timeout.load(Ordering::Relaxed);
        let total_duration = self.total_duration_ms.load(Ordering::Relaxed);

        PerformanceStatistics {
            total_tasks: total,
            success: self.success.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            timeout: self.timeout.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            avg_duration_ms: if completed == 0 {
                0.0
            } else {
                total_duration as f64 / completed as f64
            },
            slowest: self.slowest.lock().expect("stats lock poisoned").clone(),
            running: 0,
            queue_depth: 0,
            workers: 0,
        }
    }
}

struct Job {
    device: Device,
    config: MonitorConfig,
    task_id: String,
    done: oneshot::Sender<TaskResult>,
}

/// State shared between the dispatcher and the workers
struct Inner {
    collectors: CollectorRegistry,
    metrics: Arc<dyn MetricStore>,
    rules: Arc<AlertRuleEngine>,
    alarms: Arc<AlarmLifecycle>,
    tracker: Arc<TaskTracker>,
    stats: Stats,
    slow_sample: usize,

    /// Devices with a poll currently queued or executing
    in_flight: StdMutex<HashSet<i64>>,

    /// Per device-type concurrency limit
    type_limits: Mutex<HashMap<String, Arc<Semaphore>>>,

    cancel: watch::Receiver<bool>,
}

impl Inner {
    fn try_claim(&self, device_id: i64) -> bool {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .insert(device_id)
    }

    fn release(&self, device_id: i64) {
        self.in_flight
            .lock()
            .expect("in-flight lock poisoned")
            .remove(&device_id);
    }

    async fn type_limit(&self, config: &MonitorConfig) -> Arc<Semaphore> {
        self.type_limits
            .lock()
            .await
            .entry(config.device_type.clone())
            .or_insert_with(|| Arc::new(Semaphore::new(config.concurrency)))
            .clone()
    }

    /// Execute one job end to end: poll, evaluate, persist, record outcome.
    /// Always releases the device's single-flight claim.
    #[instrument(skip(self, job), fields(task_id = %job.task_id, device = %job.device.display()))]
    async fn execute(&self, job: Job) {
        let result = self.run_poll(&job).await;
        self.release(job.device.id);
        self.stats.record(&result.task, self.slow_sample);
        // the dispatcher may have given up waiting; that's fine
        let _ = job.done.send(result);
    }

    async fn run_poll(&self, job: &Job) -> TaskResult {
        if *self.cancel.borrow() {
            return self.finish(job, TaskOutcome::Failed {
                error: "cancelled".to_string(),
            });
        }

        if let Err(e) = self.tracker.mark_start(&job.task_id) {
            error!("cannot start task: {e}");
            return self.finish(job, TaskOutcome::Failed {
                error: e.to_string(),
            });
        }

        let limit = self.type_limit(&job.config).await;
        let _permit = match limit.acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return self.finish(job, TaskOutcome::Failed {
                    error: "cancelled".to_string(),
                });
            }
        };

        let Some(collector) = self.collectors.get(&job.config.protocol).await else {
            warn!("no collector registered for protocol {}", job.config.protocol);
            return self.finish(job, TaskOutcome::Failed {
                error: format!("no collector for protocol {}", job.config.protocol),
            });
        };

        let mut cancel = self.cancel.clone();
        let timeout = Duration::from_secs(job.config.timeout_secs);
        let poll = tokio::time::timeout(timeout, collector.collect(&job.device, &job.config));

        // the cancel arm resolves to a plain unit so no watch guard ends up
        // in the select output, which has to cross worker await points
        let polled = tokio::select! {
            result = poll => Some(result),
            _ = async { let _ = cancel.wait_for(|cancelled| *cancelled).await; } => None,
        };

        let outcome = match polled {
            Some(Ok(Ok(metrics))) => return self.process_metrics(job, metrics).await,
            Some(Ok(Err(e))) => {
                debug!("poll failed: {e}");
                match e {
                    crate::collector::CollectorError::Timeout(_) => TaskOutcome::Timeout,
                    other => TaskOutcome::Failed {
                        error: other.to_string(),
                    },
                }
            }
            Some(Err(_)) => TaskOutcome::Timeout,
            None => TaskOutcome::Failed {
                error: "cancelled".to_string(),
            },
        };

        self.finish(job, outcome)
    }

    /// Rule evaluation and persistence for a successful poll
    async fn process_metrics(&self, job: &Job, mut metrics: Vec<crate::Metric>) -> TaskResult {
        let mut alarms_raised = 0;

        for metric in &mut metrics {
            let matches = self.rules.evaluate(metric);

            // a metric's status reflects the worst rule that fired for it
            for m in &matches {
                if severity(m.rule.level) > severity(metric.status) {
                    metric.status = m.rule.level;
                }
            }

            for m in &matches {
                let detail = format!(
                    "{}: {} {}{} (device {})",
                    m.rule.name,
                    metric.metric_type,
                    metric.value,
                    metric.unit,
                    job.device.display(),
                );

                let raised = if m.silenced {
                    self.alarms
                        .record_silenced(m.rule.level, &metric.metric_type, metric.device_id, detail)
                        .await
                } else {
                    self.alarms
                        .create_alarm(m.rule.level, &metric.metric_type, metric.device_id, detail)
                        .await
                };

                match raised {
                    Ok(_) => alarms_raised += 1,
                    Err(e) => warn!("failed to raise alarm: {e}"),
                }
            }
        }

        let data_count = metrics.len();
        if let Err(e) = self.metrics.save_metrics(&metrics).await {
            error!("failed to persist metrics: {e}");
            let mut result = self.finish(job, TaskOutcome::Failed {
                error: format!("metric persistence failed: {e}"),
            });
            result.alarms_raised = alarms_raised;
            return result;
        }

        let mut result = self.finish(job, TaskOutcome::Success { data_count });
        result.alarms_raised = alarms_raised;
        result
    }

    fn finish(&self, job: &Job, outcome: TaskOutcome) -> TaskResult {
        match self.tracker.mark_complete(&job.task_id, outcome) {
            Ok(task) => TaskResult {
                task,
                alarms_raised: 0,
                dropped: false,
            },
            Err(e) => {
                // completion raced with something; report what the tracker has
                error!("cannot complete task {}: {e}", job.task_id);
                let task = self.tracker.get(&job.task_id).unwrap_or(MonitorTask {
                    task_id: job.task_id.clone(),
                    device_id: job.device.id,
                    task_type: "collect".to_string(),
                    status: TaskStatus::Failed,
                    created_at: chrono::Utc::now(),
                    started_at: None,
                    ended_at: None,
                    duration_ms: None,
                    data_count: 0,
                    error_message: Some(e.to_string()),
                    retry_count: 0,
                });
                TaskResult {
                    task,
                    alarms_raised: 0,
                    dropped: false,
                }
            }
        }
    }
}

fn severity(status: MetricStatus) -> u8 {
    match status {
        MetricStatus::Normal => 0,
        MetricStatus::Warning => 1,
        MetricStatus::Critical => 2,
    }
}

/// Dispatches polls onto the worker pool
pub struct Scheduler {
    inner: Arc<Inner>,
    queue: mpsc::Sender<Job>,
    overflow: OverflowPolicy,
    cancel_tx: watch::Sender<bool>,
    workers: Vec<JoinHandle<()>>,
}

impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        collectors: CollectorRegistry,
        metrics: Arc<dyn MetricStore>,
        rules: Arc<AlertRuleEngine>,
        alarms: Arc<AlarmLifecycle>,
        tracker: Arc<TaskTracker>,
    ) -> Self {
        let (queue_tx, queue_rx) = mpsc::channel::<Job>(config.queue_capacity.max(1));
        let (cancel_tx, cancel_rx) = watch::channel(false);

        let inner = Arc::new(Inner {
            collectors,
            metrics,
            rules,
            alarms,
            tracker,
            stats: Stats::default(),
            slow_sample: config.slow_sample,
            in_flight: StdMutex::new(HashSet::new()),
            type_limits: Mutex::new(HashMap::new()),
            cancel: cancel_rx,
        });

        let shared_rx = Arc::new(Mutex::new(queue_rx));
        let mut workers = Vec::with_capacity(config.workers);
        for worker_id in 0..config.workers.max(1) {
            let inner = inner.clone();
            let rx = shared_rx.clone();
            workers.push(tokio::spawn(async move {
                debug!("worker {worker_id} started");
                loop {
                    let job = { rx.lock().await.recv().await };
                    match job {
                        Some(job) => inner.execute(job).await,
                        None => break,
                    }
                }
                debug!("worker {worker_id} stopped");
            }));
        }

        info!(
            "scheduler started with {} workers, queue capacity {}",
            config.workers.max(1),
            config.queue_capacity.max(1)
        );

        Self {
            inner,
            queue: queue_tx,
            overflow: config.overflow,
            cancel_tx,
            workers,
        }
    }

    pub fn tracker(&self) -> &TaskTracker {
        &self.inner.tracker
    }

    pub fn stats(&self) -> PerformanceStatistics {
        let mut stats = self.inner.stats.snapshot();
        stats.running = self.inner.tracker.running_count();
        stats.queue_depth = self.queue.max_capacity() - self.queue.capacity();
        stats.workers = self.workers.len();
        stats
    }

    /// Signal cancellation: queued and mid-flight polls fail with "cancelled".
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    /// A receiver that flips to `true` when the scheduler is cancelled
    pub fn cancel_signal(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Cancel, close the queue and wait for the workers to drain.
    pub async fn shutdown(self) {
        self.cancel();
        drop(self.queue);
        for worker in self.workers {
            let _ = worker.await;
        }
        info!("scheduler stopped");
    }

    /// Dispatch one poll and wait for its outcome.
    ///
    /// `retry_count` is stamped on the task for attempts re-dispatched after
    /// an earlier failure in the same interval.
    #[instrument(skip(self, device, config), fields(device = %device.display()))]
    pub async fn collect_device(
        &self,
        device: Device,
        config: &MonitorConfig,
        retry_count: u32,
    ) -> TaskResult {
        // single-flight per device
        if !self.inner.try_claim(device.id) {
            let task = self.inner.tracker.create(device.id, "collect", retry_count);
            debug!("poll already in flight for device {}, skipping", device.id);
            let task = self
                .inner
                .tracker
                .mark_complete(
                    &task.task_id,
                    TaskOutcome::Failed {
                        error: "poll already in flight".to_string(),
                    },
                )
                .unwrap_or(task);
            return TaskResult {
                task,
                alarms_raised: 0,
                dropped: false,
            };
        }

        let task = self.inner.tracker.create(device.id, "collect", retry_count);
        let task_id = task.task_id.clone();
        let (done_tx, done_rx) = oneshot::channel();
        let job = Job {
            device,
            config: config.clone(),
            task_id,
            done: done_tx,
        };

        match self.queue.try_send(job) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(job)) => match self.overflow {
                OverflowPolicy::Block => {
                    if let Err(mpsc::error::SendError(job)) = self.queue.send(job).await {
                        self.inner.release(job.device.id);
                        return self.dropped(task);
                    }
                }
                OverflowPolicy::CallerRuns => {
                    self.inner.execute(job).await;
                }
                OverflowPolicy::Drop => {
                    self.inner.release(job.device.id);
                    self.inner.stats.record_dropped();
                    warn!("queue full, dropping poll for device {}", job.device.id);
                    let task = self
                        .inner
                        .tracker
                        .mark_complete(
                            &job.task_id,
                            TaskOutcome::Failed {
                                error: "queue full, poll dropped".to_string(),
                            },
                        )
                        .unwrap_or(task);
                    return TaskResult {
                        task,
                        alarms_raised: 0,
                        dropped: true,
                    };
                }
            },
            Err(mpsc::error::TrySendError::Closed(job)) => {
                self.inner.release(job.device.id);
                return self.dropped(task);
            }
        }

        match done_rx.await {
            Ok(result) => result,
            // worker went away without reporting; surface the tracker's view
            Err(_) => {
                self.inner.release(task.device_id);
                let task = self.inner.tracker.get(&task.task_id).unwrap_or(task);
                TaskResult {
                    task,
                    alarms_raised: 0,
                    dropped: false,
                }
            }
        }
    }

    fn dropped(&self, task: MonitorTask) -> TaskResult {
        let task = self
            .inner
            .tracker
            .mark_complete(
                &task.task_id,
                TaskOutcome::Failed {
                    error: "scheduler shut down".to_string(),
                },
            )
            .unwrap_or(task);
        TaskResult {
            task,
            alarms_raised: 0,
            dropped: false,
        }
    }

    /// Dispatch a batch of devices sharing one monitor config and wait for
    /// every outcome.
    #[instrument(skip(self, devices, config), fields(device_type = %config.device_type, count = devices.len()))]
    pub async fn collect_batch(
        &self,
        devices: Vec<Device>,
        config: &MonitorConfig,
    ) -> BatchSummary {
        let started = std::time::Instant::now();
        let results = futures::future::join_all(
            devices
                .into_iter()
                .map(|device| self.collect_device(device, config, 0)),
        )
        .await;

        let mut summary = BatchSummary::default();
        for result in &results {
            summary.record(result);
        }
        summary.elapsed_ms = started.elapsed().as_millis() as i64;
        if result_has_failures(&summary) {
            warn!(
                "batch for {} finished: {}/{} succeeded, {} dropped",
                config.device_type, summary.success, summary.total, summary.dropped
            );
        } else {
            debug!(
                "batch for {} finished: {} succeeded",
                config.device_type, summary.success
            );
        }
        summary
    }
}

fn result_has_failures(summary: &BatchSummary) -> bool {
    summary.failed + summary.timeout + summary.dropped > 0
}
