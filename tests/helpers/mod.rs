//! Shared builders for integration tests

use fleetwatch::config::MonitorConfig;
use fleetwatch::rules::{AlertCondition, AlertRule};
use fleetwatch::{Device, MetricStatus};

/// Device pointed at a wiremock server's address
pub fn device_for(mock_uri: &str, id: i64) -> Device {
    let mock_url = url::Url::parse(mock_uri).unwrap();
    Device {
        id,
        code: format!("SRV-{id:03}"),
        name: format!("rack server {id}"),
        device_type: "SERVER".to_string(),
        protocol: "http".to_string(),
        room_id: Some(1),
        address: mock_url.host_str().unwrap().to_string(),
        port: mock_url.port_or_known_default().unwrap(),
        token: None,
    }
}

pub fn http_monitor() -> MonitorConfig {
    MonitorConfig {
        device_type: "SERVER".to_string(),
        protocol: "http".to_string(),
        interval_secs: 60,
        timeout_secs: 2,
        concurrency: 4,
        max_retries: 0,
        enabled: true,
        params: serde_json::Value::Null,
    }
}

pub fn temperature_rule(threshold: f64, level: MetricStatus) -> AlertRule {
    AlertRule {
        id: 1,
        name: "high temperature".to_string(),
        device_id: None,
        device_type: None,
        room_id: None,
        alert_type: "temperature".to_string(),
        condition: AlertCondition::Gt,
        threshold_upper: threshold,
        threshold_lower: None,
        duration_secs: 0,
        priority: 5,
        level,
        enabled: true,
        silence_start: None,
        silence_end: None,
        recovery_notify: false,
    }
}
