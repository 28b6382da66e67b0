//! Alarm lifecycle
//!
//! Alarms move through a fixed state machine:
//!
//! ```text
//! Active ──▶ Acknowledged ──▶ Resolved ──▶ Closed
//!    └──────────────────────────▲
//! ```
//!
//! Direct `Active → Resolved` is allowed (auto-recovery); every other shortcut
//! is rejected with a [`StateError`] and the record stays untouched. Mutations
//! on one alarm are serialized through a per-alarm lock so concurrent
//! acknowledge/resolve calls cannot interleave their read-modify-write.
//!
//! Notification dispatch is at-most-once per channel: a channel's sent flag is
//! set only after the transport confirms delivery, and a set flag is never
//! attempted again. SMS is reserved for critical alarms.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};

use crate::notify::{ChannelKind, Notifier};
use crate::storage::{AlarmStore, StorageError};
use crate::{MetricStatus, StateError};

/// How many failed dispatch rounds an alarm gets before we stop retrying
const MAX_NOTIFY_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlarmStatus {
    Active,
    Acknowledged,
    Resolved,
    Closed,
}

impl AlarmStatus {
    pub fn can_transition_to(&self, next: AlarmStatus) -> bool {
        matches!(
            (self, next),
            (AlarmStatus::Active, AlarmStatus::Acknowledged)
                | (AlarmStatus::Active, AlarmStatus::Resolved)
                | (AlarmStatus::Acknowledged, AlarmStatus::Resolved)
                | (AlarmStatus::Resolved, AlarmStatus::Closed)
        )
    }

    /// Open alarms still need operator attention
    pub fn is_open(&self) -> bool {
        matches!(self, AlarmStatus::Active | AlarmStatus::Acknowledged)
    }
}

impl fmt::Display for AlarmStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmStatus::Active => write!(f, "active"),
            AlarmStatus::Acknowledged => write!(f, "acknowledged"),
            AlarmStatus::Resolved => write!(f, "resolved"),
            AlarmStatus::Closed => write!(f, "closed"),
        }
    }
}

/// One alarm raised by the rule engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: i64,
    pub level: MetricStatus,
    /// Matches the metric type that tripped the rule (e.g. "temperature")
    pub alarm_type: String,
    pub device_id: i64,
    pub detail: String,
    pub status: AlarmStatus,
    pub created_at: DateTime<Utc>,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub acknowledged_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolution: Option<String>,
    pub closed_at: Option<DateTime<Utc>>,
    pub dingtalk_sent: bool,
    pub sms_sent: bool,
    pub email_sent: bool,
    /// Failed dispatch rounds so far
    pub retry_count: u32,
    pub work_order_id: Option<String>,
}

impl AlarmRecord {
    pub fn new(level: MetricStatus, alarm_type: String, device_id: i64, detail: String) -> Self {
        Self {
            id: 0,
            level,
            alarm_type,
            device_id,
            detail,
            status: AlarmStatus::Active,
            created_at: Utc::now(),
            acknowledged_at: None,
            acknowledged_by: None,
            resolved_at: None,
            resolved_by: None,
            resolution: None,
            closed_at: None,
            dingtalk_sent: false,
            sms_sent: false,
            email_sent: false,
            retry_count: 0,
            work_order_id: None,
        }
    }
}

/// Errors from lifecycle operations
#[derive(Debug)]
pub enum AlarmError {
    /// Persistence failure
    Storage(StorageError),

    /// Illegal state transition; the alarm is unchanged
    State(StateError),

    /// No alarm with that id
    NotFound(i64),
}

impl fmt::Display for AlarmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlarmError::Storage(err) => write!(f, "alarm store error: {err}"),
            AlarmError::State(err) => write!(f, "{err}"),
            AlarmError::NotFound(id) => write!(f, "alarm {id} not found"),
        }
    }
}

impl std::error::Error for AlarmError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AlarmError::Storage(err) => Some(err),
            AlarmError::State(err) => Some(err),
            AlarmError::NotFound(_) => None,
        }
    }
}

impl From<StorageError> for AlarmError {
    fn from(err: StorageError) -> Self {
        AlarmError::Storage(err)
    }
}

/// External ticketing collaborator
///
/// Implementations open a work order in the facility's ticketing system and
/// return its identifier.
#[async_trait]
pub trait WorkOrderService: Send + Sync {
    async fn open_work_order(&self, alarm: &AlarmRecord) -> anyhow::Result<String>;
}

/// Owns alarm state transitions and notification fan-out
pub struct AlarmLifecycle {
    store: Arc<dyn AlarmStore>,
    notifier: Arc<dyn Notifier>,
    work_orders: Option<Arc<dyn WorkOrderService>>,
    locks: Mutex<HashMap<i64, Arc<tokio::sync::Mutex<()>>>>,
}

impl AlarmLifecycle {
    pub fn new(store: Arc<dyn AlarmStore>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            store,
            notifier,
            work_orders: None,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_work_orders(mut self, service: Arc<dyn WorkOrderService>) -> Self {
        self.work_orders = Some(service);
        self
    }

    fn lock_for(&self, id: i64) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("alarm lock map poisoned")
            .entry(id)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone()
    }

    /// Persist a new Active alarm and immediately attempt notification
    /// dispatch. Dispatch failures never fail the raise; they are retried on
    /// later [`AlarmLifecycle::retry_unsent`] rounds.
    #[instrument(skip(self, detail))]
    pub async fn create_alarm(
        &self,
        level: MetricStatus,
        alarm_type: &str,
        device_id: i64,
        detail: String,
    ) -> Result<AlarmRecord, AlarmError> {
        let alarm = AlarmRecord::new(level, alarm_type.to_string(), device_id, detail);
        let id = self.store.insert(alarm).await?;
        info!(alarm_id = id, "raised {level:?} alarm for device {device_id}");

        // once inserted, the record is visible to retry rounds; dispatch must
        // hold the per-alarm lock and work on a fresh read, or two dispatchers
        // could each deliver the same channel
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut stored = self
            .store
            .get(id)
            .await?
            .ok_or(AlarmError::NotFound(id))?;
        if Self::channels_pending(&stored) {
            self.dispatch_notifications(&mut stored).await;
            self.store.update(&stored).await?;
        }
        Ok(stored)
    }

    /// Persist a new Active alarm without any notification dispatch.
    ///
    /// Used for matches inside a rule's silence window: the record exists for
    /// the audit trail, but every channel is marked delivered up front so no
    /// retry round will ever touch it.
    #[instrument(skip(self, detail))]
    pub async fn record_silenced(
        &self,
        level: MetricStatus,
        alarm_type: &str,
        device_id: i64,
        detail: String,
    ) -> Result<AlarmRecord, AlarmError> {
        let mut alarm = AlarmRecord::new(level, alarm_type.to_string(), device_id, detail);
        alarm.dingtalk_sent = true;
        alarm.sms_sent = true;
        alarm.email_sent = true;

        let id = self.store.insert(alarm).await?;
        let stored = self
            .store
            .get(id)
            .await?
            .ok_or(AlarmError::NotFound(id))?;
        info!(alarm_id = id, "recorded silenced {level:?} alarm for device {device_id}");
        Ok(stored)
    }

    /// Active → Acknowledged
    #[instrument(skip(self))]
    pub async fn acknowledge(&self, id: i64, by: &str) -> Result<AlarmRecord, AlarmError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut alarm = self.store.get(id).await?.ok_or(AlarmError::NotFound(id))?;
        self.transition(&mut alarm, AlarmStatus::Acknowledged)?;
        alarm.acknowledged_at = Some(Utc::now());
        alarm.acknowledged_by = Some(by.to_string());
        self.store.update(&alarm).await?;
        info!(alarm_id = id, "alarm acknowledged by {by}");
        Ok(alarm)
    }

    /// Active|Acknowledged → Resolved
    #[instrument(skip(self, resolution))]
    pub async fn resolve(
        &self,
        id: i64,
        by: &str,
        resolution: Option<String>,
    ) -> Result<AlarmRecord, AlarmError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut alarm = self.store.get(id).await?.ok_or(AlarmError::NotFound(id))?;
        self.transition(&mut alarm, AlarmStatus::Resolved)?;
        alarm.resolved_at = Some(Utc::now());
        alarm.resolved_by = Some(by.to_string());
        alarm.resolution = resolution;
        self.store.update(&alarm).await?;
        info!(alarm_id = id, "alarm resolved by {by}");
        Ok(alarm)
    }

    /// Resolved → Closed
    #[instrument(skip(self))]
    pub async fn close(&self, id: i64) -> Result<AlarmRecord, AlarmError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut alarm = self.store.get(id).await?.ok_or(AlarmError::NotFound(id))?;
        self.transition(&mut alarm, AlarmStatus::Closed)?;
        alarm.closed_at = Some(Utc::now());
        self.store.update(&alarm).await?;

        // Closed is terminal, so the lock entry is not needed anymore; the
        // held guard keeps its Arc alive until we return
        self.locks
            .lock()
            .expect("alarm lock map poisoned")
            .remove(&id);
        Ok(alarm)
    }

    fn transition(&self, alarm: &mut AlarmRecord, next: AlarmStatus) -> Result<(), AlarmError> {
        if !alarm.status.can_transition_to(next) {
            return Err(AlarmError::State(StateError {
                entity: "alarm",
                from: alarm.status.to_string(),
                to: next.to_string(),
            }));
        }
        alarm.status = next;
        Ok(())
    }

    /// Idempotent: the first call opens a work order and records its id;
    /// repeats return the existing id without touching the ticketing system.
    #[instrument(skip(self))]
    pub async fn link_work_order(&self, id: i64) -> Result<Option<String>, AlarmError> {
        let lock = self.lock_for(id);
        let _guard = lock.lock().await;

        let mut alarm = self.store.get(id).await?.ok_or(AlarmError::NotFound(id))?;
        if alarm.work_order_id.is_some() {
            return Ok(alarm.work_order_id);
        }

        let Some(service) = &self.work_orders else {
            return Ok(None);
        };

        match service.open_work_order(&alarm).await {
            Ok(order_id) => {
                alarm.work_order_id = Some(order_id.clone());
                self.store.update(&alarm).await?;
                info!(alarm_id = id, "linked work order {order_id}");
                Ok(Some(order_id))
            }
            Err(e) => {
                warn!(alarm_id = id, "work order creation failed: {e}");
                Ok(None)
            }
        }
    }

    /// One dispatch round over the channels whose flag is still unset.
    ///
    /// SMS is only attempted for critical alarms. `retry_count` goes up by one
    /// when any channel in the round fails.
    async fn dispatch_notifications(&self, alarm: &mut AlarmRecord) {
        let mut round_failed = false;

        if !alarm.dingtalk_sent {
            match self.notifier.send(ChannelKind::DingTalk, alarm).await {
                Ok(()) => alarm.dingtalk_sent = true,
                Err(e) => {
                    warn!(alarm_id = alarm.id, "dingtalk dispatch failed: {e}");
                    round_failed = true;
                }
            }
        }

        if alarm.level == MetricStatus::Critical && !alarm.sms_sent {
            match self.notifier.send(ChannelKind::Sms, alarm).await {
                Ok(()) => alarm.sms_sent = true,
                Err(e) => {
                    warn!(alarm_id = alarm.id, "sms dispatch failed: {e}");
                    round_failed = true;
                }
            }
        }

        if !alarm.email_sent {
            match self.notifier.send(ChannelKind::Email, alarm).await {
                Ok(()) => alarm.email_sent = true,
                Err(e) => {
                    warn!(alarm_id = alarm.id, "email dispatch failed: {e}");
                    round_failed = true;
                }
            }
        }

        if round_failed {
            alarm.retry_count += 1;
        }
    }

    fn channels_pending(alarm: &AlarmRecord) -> bool {
        !alarm.dingtalk_sent
            || !alarm.email_sent
            || (alarm.level == MetricStatus::Critical && !alarm.sms_sent)
    }

    /// Retry dispatch for open alarms with undelivered channels.
    ///
    /// Runs on the scheduler's maintenance cadence. Alarms that have exhausted
    /// their retry rounds are skipped for good.
    #[instrument(skip(self))]
    pub async fn retry_unsent(&self) -> Result<usize, AlarmError> {
        let open = self.store.list_open().await?;
        let mut retried = 0;

        for candidate in open {
            if !Self::channels_pending(&candidate) || candidate.retry_count >= MAX_NOTIFY_RETRIES {
                continue;
            }

            let lock = self.lock_for(candidate.id);
            let _guard = lock.lock().await;

            // the list_open snapshot may be stale by the time the lock is
            // ours: another dispatcher may have delivered the channels, or an
            // operator may have moved the alarm on. Re-read and re-check so
            // the update below never writes an old snapshot back.
            let Some(mut alarm) = self.store.get(candidate.id).await? else {
                continue;
            };
            if !alarm.status.is_open()
                || !Self::channels_pending(&alarm)
                || alarm.retry_count >= MAX_NOTIFY_RETRIES
            {
                continue;
            }

            self.dispatch_notifications(&mut alarm).await;
            self.store.update(&alarm).await?;
            retried += 1;
        }

        Ok(retried)
    }
}
