//! End-to-end pipeline tests: HTTP device endpoint → collector → rules →
//! alarms → notification webhook, all against mock servers.

mod helpers;

use std::sync::Arc;

use fleetwatch::MetricStatus;
use fleetwatch::alarm::{AlarmLifecycle, AlarmStatus};
use fleetwatch::collector::{CollectorRegistry, HttpCollector};
use fleetwatch::config::{DingTalkConfig, SchedulerConfig};
use fleetwatch::notify::DingTalkNotifier;
use fleetwatch::rules::AlertRuleEngine;
use fleetwatch::scheduler::Scheduler;
use fleetwatch::storage::{AlarmStore, MemoryAlarmStore, MemoryMetricStore, MetricStore};
use fleetwatch::task::{TaskStatus, TaskTracker};
use helpers::{device_for, http_monitor, temperature_rule};
use pretty_assertions::assert_eq;
use tokio_test::assert_ok;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

struct Pipeline {
    scheduler: Scheduler,
    metrics: Arc<MemoryMetricStore>,
    alarm_store: Arc<MemoryAlarmStore>,
    alarms: Arc<AlarmLifecycle>,
}

async fn pipeline(webhook_uri: &str, rules: Vec<fleetwatch::rules::AlertRule>) -> Pipeline {
    let collectors = CollectorRegistry::new();
    collectors
        .register("http", Arc::new(HttpCollector::new()), None)
        .await;

    let metrics = Arc::new(MemoryMetricStore::new());
    let alarm_store = Arc::new(MemoryAlarmStore::new());
    let notifier = Arc::new(DingTalkNotifier::new(DingTalkConfig {
        url: format!("{webhook_uri}/robot/send"),
        keyword: Some("DCIM".to_string()),
    }));
    let alarms = Arc::new(AlarmLifecycle::new(alarm_store.clone(), notifier));

    let scheduler = Scheduler::new(
        SchedulerConfig::default(),
        collectors,
        metrics.clone(),
        Arc::new(AlertRuleEngine::new(rules)),
        alarms.clone(),
        Arc::new(TaskTracker::new()),
    );

    Pipeline {
        scheduler,
        metrics,
        alarm_store,
        alarms,
    }
}

async fn mock_device(temperature: f64) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/readings"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "readings": [
                {"metric_type": "temperature", "value": temperature, "unit": "°C"}
            ]
        })))
        .mount(&server)
        .await;
    server
}

#[tokio::test]
async fn hot_device_raises_alarm_and_hits_webhook() {
    let device_server = mock_device(95.0).await;
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/robot/send"))
        .and(body_partial_json(serde_json::json!({"msgtype": "markdown"})))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&webhook)
        .await;

    let pipeline = pipeline(
        &webhook.uri(),
        vec![temperature_rule(80.0, MetricStatus::Critical)],
    )
    .await;

    let result = pipeline
        .scheduler
        .collect_device(device_for(&device_server.uri(), 1), &http_monitor(), 0)
        .await;

    assert_eq!(result.task.status, TaskStatus::Success);
    assert_eq!(result.task.data_count, 1);
    assert_eq!(result.alarms_raised, 1);

    // the stored metric carries the rule's severity
    let stored = pipeline.metrics.query_latest(1, 10).await.unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, MetricStatus::Critical);

    // the alarm is open and the webhook channel confirmed delivery
    let open = pipeline.alarm_store.list_open().await.unwrap();
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, AlarmStatus::Active);
    assert_eq!(open[0].level, MetricStatus::Critical);
    assert!(open[0].dingtalk_sent);
}

#[tokio::test]
async fn cool_device_stores_metrics_without_alarms() {
    let device_server = mock_device(22.0).await;
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&webhook)
        .await;

    let pipeline = pipeline(
        &webhook.uri(),
        vec![temperature_rule(80.0, MetricStatus::Warning)],
    )
    .await;

    let result = pipeline
        .scheduler
        .collect_device(device_for(&device_server.uri(), 1), &http_monitor(), 0)
        .await;

    assert_eq!(result.task.status, TaskStatus::Success);
    assert_eq!(result.alarms_raised, 0);

    let stored = pipeline.metrics.query_latest(1, 10).await.unwrap();
    assert_eq!(stored[0].status, MetricStatus::Normal);
    assert!(pipeline.alarm_store.list_open().await.unwrap().is_empty());
}

#[tokio::test]
async fn unreachable_device_fails_the_task() {
    let webhook = MockServer::start().await;
    let pipeline = pipeline(&webhook.uri(), vec![]).await;

    // port 1 is essentially never listening
    let mut device = device_for("http://127.0.0.1:80", 1);
    device.port = 1;

    let result = pipeline
        .scheduler
        .collect_device(device, &http_monitor(), 0)
        .await;

    assert_eq!(result.task.status, TaskStatus::Failed);
    assert!(
        result
            .task
            .error_message
            .unwrap()
            .contains("device unreachable")
    );
}

#[tokio::test]
async fn operator_walks_alarm_through_lifecycle() {
    let device_server = mock_device(95.0).await;
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&webhook)
        .await;

    let pipeline = pipeline(
        &webhook.uri(),
        vec![temperature_rule(80.0, MetricStatus::Warning)],
    )
    .await;

    pipeline
        .scheduler
        .collect_device(device_for(&device_server.uri(), 1), &http_monitor(), 0)
        .await;

    let alarm_id = pipeline.alarm_store.list_open().await.unwrap()[0].id;

    let alarm = assert_ok!(pipeline.alarms.acknowledge(alarm_id, "alice").await);
    assert_eq!(alarm.status, AlarmStatus::Acknowledged);

    let alarm = assert_ok!(
        pipeline
            .alarms
            .resolve(alarm_id, "alice", Some("CRAC setpoint adjusted".to_string()))
            .await
    );
    assert_eq!(alarm.status, AlarmStatus::Resolved);

    let alarm = assert_ok!(pipeline.alarms.close(alarm_id).await);
    assert_eq!(alarm.status, AlarmStatus::Closed);
    assert!(pipeline.alarm_store.list_open().await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_webhook_leaves_alarm_retryable() {
    let device_server = mock_device(95.0).await;
    let webhook = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/robot/send"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&webhook)
        .await;

    let pipeline = pipeline(
        &webhook.uri(),
        vec![temperature_rule(80.0, MetricStatus::Warning)],
    )
    .await;

    let result = pipeline
        .scheduler
        .collect_device(device_for(&device_server.uri(), 1), &http_monitor(), 0)
        .await;

    // dispatch failure never fails the poll
    assert_eq!(result.task.status, TaskStatus::Success);
    assert_eq!(result.alarms_raised, 1);

    let open = pipeline.alarm_store.list_open().await.unwrap();
    assert!(!open[0].dingtalk_sent);
    assert_eq!(open[0].retry_count, 1);
}
