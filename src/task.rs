//! Polling task state machine
//!
//! Every dispatched poll is tracked as a [`MonitorTask`]:
//!
//! ```text
//! Pending ──▶ Running ──▶ Success | Failed | Timeout
//! ```
//!
//! Transitions are one-directional; a task never re-enters `Running` after a
//! terminal state and is never reused. [`TaskTracker::mark_complete`] is the
//! only place that sets a terminal status.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::StateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Success | TaskStatus::Failed | TaskStatus::Timeout)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Running => write!(f, "running"),
            TaskStatus::Success => write!(f, "success"),
            TaskStatus::Failed => write!(f, "failed"),
            TaskStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// Terminal outcome reported by the worker executing a task
#[derive(Debug, Clone)]
pub enum TaskOutcome {
    Success { data_count: usize },
    Failed { error: String },
    Timeout,
}

/// One polling attempt and its outcome
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorTask {
    pub task_id: String,
    pub device_id: i64,
    pub task_type: String,
    pub status: TaskStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
    pub data_count: usize,
    pub error_message: Option<String>,
    pub retry_count: u32,
}

/// Records the state machine of every polling attempt
///
/// The tracker is shared between the scheduler's workers; mutation happens
/// only through `mark_start` / `mark_complete`, each holding the map lock for
/// the duration of one small update.
#[derive(Debug, Default)]
pub struct TaskTracker {
    tasks: Mutex<HashMap<String, MonitorTask>>,
    seq: AtomicU64,
}

impl TaskTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a new Pending task for a device and register it
    pub fn create(&self, device_id: i64, task_type: &str, retry_count: u32) -> MonitorTask {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        let task = MonitorTask {
            task_id: format!("task-{device_id}-{seq}"),
            device_id,
            task_type: task_type.to_string(),
            status: TaskStatus::Pending,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
            duration_ms: None,
            data_count: 0,
            error_message: None,
            retry_count,
        };

        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .insert(task.task_id.clone(), task.clone());

        task
    }

    /// Claim a task for execution: Pending → Running, sets `started_at`.
    ///
    /// Idempotent: a second call on a Running task is a logged no-op. Calling
    /// it on a terminal task is a `StateError`.
    pub fn mark_start(&self, task_id: &str) -> Result<(), StateError> {
        let mut tasks = self.tasks.lock().expect("task map lock poisoned");
        let Some(task) = tasks.get_mut(task_id) else {
            return Err(StateError {
                entity: "task",
                from: "unknown".to_string(),
                to: TaskStatus::Running.to_string(),
            });
        };

        match task.status {
            TaskStatus::Pending => {
                task.status = TaskStatus::Running;
                task.started_at = Some(Utc::now());
                Ok(())
            }
            TaskStatus::Running => {
                warn!("mark_start called twice for {task_id}, ignoring");
                Ok(())
            }
            terminal => Err(StateError {
                entity: "task",
                from: terminal.to_string(),
                to: TaskStatus::Running.to_string(),
            }),
        }
    }

    /// Finish a task. The only place a terminal status is set; computes
    /// `duration_ms` from `started_at`.
    pub fn mark_complete(
        &self,
        task_id: &str,
        outcome: TaskOutcome,
    ) -> Result<MonitorTask, StateError> {
        let mut tasks = self.tasks.lock().expect("task map lock poisoned");
        let Some(task) = tasks.get_mut(task_id) else {
            return Err(StateError {
                entity: "task",
                from: "unknown".to_string(),
                to: "terminal".to_string(),
            });
        };

        if task.status.is_terminal() {
            return Err(StateError {
                entity: "task",
                from: task.status.to_string(),
                to: "terminal".to_string(),
            });
        }

        let ended_at = Utc::now();
        task.ended_at = Some(ended_at);
        task.duration_ms = task
            .started_at
            .map(|started| (ended_at - started).num_milliseconds());

        match outcome {
            TaskOutcome::Success { data_count } => {
                task.status = TaskStatus::Success;
                task.data_count = data_count;
            }
            TaskOutcome::Failed { error } => {
                task.status = TaskStatus::Failed;
                task.error_message = Some(error);
            }
            TaskOutcome::Timeout => {
                task.status = TaskStatus::Timeout;
                task.error_message = Some("collection timed out".to_string());
            }
        }

        Ok(task.clone())
    }

    pub fn get(&self, task_id: &str) -> Option<MonitorTask> {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .get(task_id)
            .cloned()
    }

    /// Number of tasks currently in the Running state
    pub fn running_count(&self) -> usize {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .values()
            .filter(|t| t.status == TaskStatus::Running)
            .count()
    }

    /// All tasks for a device, most recent first
    pub fn tasks_for_device(&self, device_id: i64) -> Vec<MonitorTask> {
        let mut tasks: Vec<_> = self
            .tasks
            .lock()
            .expect("task map lock poisoned")
            .values()
            .filter(|t| t.device_id == device_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        tasks
    }

    /// All tasks in a terminal state (for archiving before a purge)
    pub fn completed_tasks(&self) -> Vec<MonitorTask> {
        self.tasks
            .lock()
            .expect("task map lock poisoned")
            .values()
            .filter(|t| t.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Maintenance: drop terminal tasks with `ended_at < cutoff`.
    ///
    /// Pending/Running tasks are never purged regardless of age; age alone
    /// does not imply staleness for a task that has not finished.
    pub fn purge_completed_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut tasks = self.tasks.lock().expect("task map lock poisoned");
        let before = tasks.len();
        tasks.retain(|_, task| {
            !(task.status.is_terminal() && task.ended_at.is_some_and(|ended| ended < cutoff))
        });
        let purged = before - tasks.len();
        if purged > 0 {
            debug!("purged {purged} completed tasks older than {cutoff}");
        }
        purged
    }
}
