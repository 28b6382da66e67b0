//! SQLite persistence backend
//!
//! One embedded database file holds metric history, alarm records and the
//! archive of finished polling tasks. Suited to single-hub deployments up to
//! a few thousand devices.
//!
//! - WAL mode for concurrent reads during batch writes
//! - connection pooling via sqlx
//! - schema versioning through sqlx migrations

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Pool, Row, Sqlite};
use tracing::{debug, info, instrument};

use super::error::{StorageError, StorageResult};
use super::traits::{AlarmStore, MetricStore, TaskArchive};
use crate::alarm::{AlarmRecord, AlarmStatus};
use crate::task::{MonitorTask, TaskStatus};
use crate::{Metric, MetricStatus};

/// SQLite-backed [`MetricStore`], [`AlarmStore`] and [`TaskArchive`]
pub struct SqliteBackend {
    pool: Pool<Sqlite>,
}

impl SqliteBackend {
    /// Open (or create) the database file and run pending migrations.
    #[instrument(skip_all)]
    pub async fn new(db_path: impl AsRef<Path>) -> StorageResult<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        info!("initializing SQLite backend at: {}", db_path_str);

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(std::time::Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .map_err(|e| StorageError::ConnectionFailed(e.to_string()))?;

        debug!("running database migrations");
        sqlx::migrate!("./migrations").run(&pool).await?;

        Ok(Self { pool })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    fn millis(dt: &DateTime<Utc>) -> i64 {
        dt.timestamp_millis()
    }

    fn timestamp(millis: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(millis).unwrap_or_else(Utc::now)
    }

    fn opt_timestamp(millis: Option<i64>) -> Option<DateTime<Utc>> {
        millis.map(Self::timestamp)
    }
}

fn metric_status_str(status: MetricStatus) -> &'static str {
    match status {
        MetricStatus::Normal => "normal",
        MetricStatus::Warning => "warning",
        MetricStatus::Critical => "critical",
    }
}

fn parse_metric_status(s: &str) -> StorageResult<MetricStatus> {
    match s {
        "normal" => Ok(MetricStatus::Normal),
        "warning" => Ok(MetricStatus::Warning),
        "critical" => Ok(MetricStatus::Critical),
        other => Err(StorageError::SerializationError(format!(
            "unknown metric status: {other}"
        ))),
    }
}

fn parse_alarm_status(s: &str) -> StorageResult<AlarmStatus> {
    match s {
        "active" => Ok(AlarmStatus::Active),
        "acknowledged" => Ok(AlarmStatus::Acknowledged),
        "resolved" => Ok(AlarmStatus::Resolved),
        "closed" => Ok(AlarmStatus::Closed),
        other => Err(StorageError::SerializationError(format!(
            "unknown alarm status: {other}"
        ))),
    }
}

fn parse_task_status(s: &str) -> StorageResult<TaskStatus> {
    match s {
        "pending" => Ok(TaskStatus::Pending),
        "running" => Ok(TaskStatus::Running),
        "success" => Ok(TaskStatus::Success),
        "failed" => Ok(TaskStatus::Failed),
        "timeout" => Ok(TaskStatus::Timeout),
        other => Err(StorageError::SerializationError(format!(
            "unknown task status: {other}"
        ))),
    }
}

fn alarm_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<AlarmRecord> {
    let level: String = row.get("level");
    let status: String = row.get("status");
    Ok(AlarmRecord {
        id: row.get("id"),
        level: parse_metric_status(&level)?,
        alarm_type: row.get("alarm_type"),
        device_id: row.get("device_id"),
        detail: row.get("detail"),
        status: parse_alarm_status(&status)?,
        created_at: SqliteBackend::timestamp(row.get("created_at")),
        acknowledged_at: SqliteBackend::opt_timestamp(row.get("acknowledged_at")),
        acknowledged_by: row.get("acknowledged_by"),
        resolved_at: SqliteBackend::opt_timestamp(row.get("resolved_at")),
        resolved_by: row.get("resolved_by"),
        resolution: row.get("resolution"),
        closed_at: SqliteBackend::opt_timestamp(row.get("closed_at")),
        dingtalk_sent: row.get("dingtalk_sent"),
        sms_sent: row.get("sms_sent"),
        email_sent: row.get("email_sent"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
        work_order_id: row.get("work_order_id"),
    })
}

fn metric_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<Metric> {
    let status: String = row.get("status");
    Ok(Metric {
        device_id: row.get("device_id"),
        device_type: row.get("device_type"),
        room_id: row.get("room_id"),
        metric_type: row.get("metric_type"),
        value: row.get("value"),
        unit: row.get("unit"),
        collected_at: SqliteBackend::timestamp(row.get("collected_at")),
        status: parse_metric_status(&status)?,
    })
}

fn task_from_row(row: &sqlx::sqlite::SqliteRow) -> StorageResult<MonitorTask> {
    let status: String = row.get("status");
    Ok(MonitorTask {
        task_id: row.get("task_id"),
        device_id: row.get("device_id"),
        task_type: row.get("task_type"),
        status: parse_task_status(&status)?,
        created_at: SqliteBackend::timestamp(row.get("created_at")),
        started_at: SqliteBackend::opt_timestamp(row.get("started_at")),
        ended_at: SqliteBackend::opt_timestamp(row.get("ended_at")),
        duration_ms: row.get("duration_ms"),
        data_count: row.get::<i64, _>("data_count") as usize,
        error_message: row.get("error_message"),
        retry_count: row.get::<i64, _>("retry_count") as u32,
    })
}

#[async_trait]
impl MetricStore for SqliteBackend {
    #[instrument(skip(self, metrics), fields(count = metrics.len()))]
    async fn save_metrics(&self, metrics: &[Metric]) -> StorageResult<()> {
        if metrics.is_empty() {
            return Ok(());
        }

        // One transaction per batch
        let mut tx = self.pool.begin().await?;

        for metric in metrics {
            sqlx::query(
                r#"
                INSERT INTO metrics (
                    device_id, device_type, room_id, metric_type,
                    value, unit, collected_at, status
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(metric.device_id)
            .bind(&metric.device_type)
            .bind(metric.room_id)
            .bind(&metric.metric_type)
            .bind(metric.value)
            .bind(&metric.unit)
            .bind(Self::millis(&metric.collected_at))
            .bind(metric_status_str(metric.status))
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        debug!("batch insert complete");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn query_latest(&self, device_id: i64, limit: usize) -> StorageResult<Vec<Metric>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, device_type, room_id, metric_type,
                   value, unit, collected_at, status
            FROM metrics
            WHERE device_id = ?
            ORDER BY collected_at DESC
            LIMIT ?
            "#,
        )
        .bind(device_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut metrics = rows
            .iter()
            .map(metric_from_row)
            .collect::<StorageResult<Vec<_>>>()?;
        // chronological order, oldest first
        metrics.reverse();
        Ok(metrics)
    }

    #[instrument(skip(self))]
    async fn query_range(
        &self,
        device_id: i64,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<Metric>> {
        let rows = sqlx::query(
            r#"
            SELECT device_id, device_type, room_id, metric_type,
                   value, unit, collected_at, status
            FROM metrics
            WHERE device_id = ? AND collected_at >= ? AND collected_at <= ?
            ORDER BY collected_at ASC
            "#,
        )
        .bind(device_id)
        .bind(Self::millis(&start))
        .bind(Self::millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(metric_from_row).collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_metrics(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM metrics WHERE collected_at < ?")
            .bind(Self::millis(&before))
            .execute(&self.pool)
            .await?;

        let deleted = result.rows_affected() as usize;
        if deleted > 0 {
            info!("deleted {deleted} old metrics");
        }
        Ok(deleted)
    }
}

#[async_trait]
impl AlarmStore for SqliteBackend {
    #[instrument(skip(self, alarm))]
    async fn insert(&self, alarm: AlarmRecord) -> StorageResult<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO alarms (
                level, alarm_type, device_id, detail, status, created_at,
                acknowledged_at, acknowledged_by, resolved_at, resolved_by,
                resolution, closed_at, dingtalk_sent, sms_sent, email_sent,
                retry_count, work_order_id
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(metric_status_str(alarm.level))
        .bind(&alarm.alarm_type)
        .bind(alarm.device_id)
        .bind(&alarm.detail)
        .bind(alarm.status.to_string())
        .bind(Self::millis(&alarm.created_at))
        .bind(alarm.acknowledged_at.as_ref().map(Self::millis))
        .bind(&alarm.acknowledged_by)
        .bind(alarm.resolved_at.as_ref().map(Self::millis))
        .bind(&alarm.resolved_by)
        .bind(&alarm.resolution)
        .bind(alarm.closed_at.as_ref().map(Self::millis))
        .bind(alarm.dingtalk_sent)
        .bind(alarm.sms_sent)
        .bind(alarm.email_sent)
        .bind(alarm.retry_count as i64)
        .bind(&alarm.work_order_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    async fn get(&self, id: i64) -> StorageResult<Option<AlarmRecord>> {
        let row = sqlx::query("SELECT * FROM alarms WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.as_ref().map(alarm_from_row).transpose()
    }

    #[instrument(skip(self, alarm), fields(alarm_id = alarm.id))]
    async fn update(&self, alarm: &AlarmRecord) -> StorageResult<()> {
        let result = sqlx::query(
            r#"
            UPDATE alarms SET
                status = ?, acknowledged_at = ?, acknowledged_by = ?,
                resolved_at = ?, resolved_by = ?, resolution = ?, closed_at = ?,
                dingtalk_sent = ?, sms_sent = ?, email_sent = ?,
                retry_count = ?, work_order_id = ?
            WHERE id = ?
            "#,
        )
        .bind(alarm.status.to_string())
        .bind(alarm.acknowledged_at.as_ref().map(Self::millis))
        .bind(&alarm.acknowledged_by)
        .bind(alarm.resolved_at.as_ref().map(Self::millis))
        .bind(&alarm.resolved_by)
        .bind(&alarm.resolution)
        .bind(alarm.closed_at.as_ref().map(Self::millis))
        .bind(alarm.dingtalk_sent)
        .bind(alarm.sms_sent)
        .bind(alarm.email_sent)
        .bind(alarm.retry_count as i64)
        .bind(&alarm.work_order_id)
        .bind(alarm.id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("alarm {}", alarm.id)));
        }
        Ok(())
    }

    async fn list_open(&self) -> StorageResult<Vec<AlarmRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alarms
            WHERE status IN ('active', 'acknowledged')
            ORDER BY created_at ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alarm_from_row).collect()
    }

    async fn query_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<AlarmRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alarms
            WHERE created_at >= ? AND created_at <= ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(Self::millis(&start))
        .bind(Self::millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(alarm_from_row).collect()
    }
}

#[async_trait]
impl TaskArchive for SqliteBackend {
    #[instrument(skip(self, tasks), fields(count = tasks.len()))]
    async fn archive_tasks(&self, tasks: &[MonitorTask]) -> StorageResult<()> {
        if tasks.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;

        for task in tasks {
            sqlx::query(
                r#"
                INSERT INTO tasks (
                    task_id, device_id, task_type, status, created_at,
                    started_at, ended_at, duration_ms, data_count,
                    error_message, retry_count
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT (task_id) DO NOTHING
                "#,
            )
            .bind(&task.task_id)
            .bind(task.device_id)
            .bind(&task.task_type)
            .bind(task.status.to_string())
            .bind(Self::millis(&task.created_at))
            .bind(task.started_at.as_ref().map(Self::millis))
            .bind(task.ended_at.as_ref().map(Self::millis))
            .bind(task.duration_ms)
            .bind(task.data_count as i64)
            .bind(&task.error_message)
            .bind(task.retry_count as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn query_tasks_range(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<MonitorTask>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM tasks
            WHERE created_at >= ? AND created_at <= ?
            ORDER BY created_at ASC
            "#,
        )
        .bind(Self::millis(&start))
        .bind(Self::millis(&end))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    #[instrument(skip(self), fields(before = %before))]
    async fn cleanup_old_tasks(&self, before: DateTime<Utc>) -> StorageResult<usize> {
        let result = sqlx::query("DELETE FROM tasks WHERE ended_at IS NOT NULL AND ended_at < ?")
            .bind(Self::millis(&before))
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() as usize)
    }
}
