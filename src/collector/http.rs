//! HTTP collector - polls device agents exposing a JSON readings endpoint
//!
//! Many devices in the fleet (servers, smart PDUs, gateway boxes in front of
//! sensor buses) expose their readings as a JSON document over HTTP. This
//! collector GETs that document and normalizes it into [`Metric`]s.
//!
//! The HTTP client is built once and reused across requests.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use tracing::{instrument, trace};

use crate::config::MonitorConfig;
use crate::{Device, Metric, MetricStatus};

use super::{Collector, CollectorError, CollectorResult};

const DEFAULT_PATH: &str = "/readings";
const SECRET_HEADER: &str = "X-MONITORING-SECRET";

/// One reading as reported by a device endpoint
#[derive(Debug, Deserialize)]
struct Reading {
    metric_type: String,
    value: f64,
    #[serde(default)]
    unit: String,
}

#[derive(Debug, Deserialize)]
struct ReadingsDocument {
    readings: Vec<Reading>,
}

/// Collector for HTTP/JSON device endpoints
#[derive(Debug, Clone)]
pub struct HttpCollector {
    client: reqwest::Client,
}

impl HttpCollector {
    pub fn new() -> Self {
        Self {
            // Per-poll deadlines come from MonitorConfig; this is only the
            // hard upper bound for a single request.
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .expect("Failed to build HTTP client"),
        }
    }

    /// Endpoint path, overridable via the monitor config's `params.path`
    fn path(config: &MonitorConfig) -> String {
        config
            .params
            .get("path")
            .and_then(|v| v.as_str())
            .unwrap_or(DEFAULT_PATH)
            .to_string()
    }
}

impl Default for HttpCollector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Collector for HttpCollector {
    fn protocol(&self) -> &str {
        "http"
    }

    #[instrument(skip(self, config), fields(device = %device.display()))]
    async fn collect(&self, device: &Device, config: &MonitorConfig) -> CollectorResult<Vec<Metric>> {
        let url = format!(
            "http://{}:{}{}",
            device.address,
            device.port,
            Self::path(config)
        );

        trace!("requesting readings from {url}");

        let mut request = self
            .client
            .get(&url)
            .timeout(Duration::from_secs(config.timeout_secs));

        if let Some(token) = &device.token {
            request = request.header(SECRET_HEADER, token);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                CollectorError::Timeout(format!("{url}: {e}"))
            } else if e.is_connect() {
                CollectorError::Unreachable(format!("{url}: {e}"))
            } else {
                CollectorError::Protocol(format!("{url}: {e}"))
            }
        })?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(CollectorError::Auth(format!("{url}: HTTP {status}")));
        }
        if !status.is_success() {
            return Err(CollectorError::Protocol(format!("{url}: HTTP {status}")));
        }

        let body = response
            .text()
            .await
            .map_err(|e| CollectorError::Protocol(format!("{url}: failed to read body: {e}")))?;

        let document: ReadingsDocument = serde_json::from_str(&body)
            .map_err(|e| CollectorError::Protocol(format!("{url}: invalid readings JSON: {e}")))?;

        trace!("parsed {} readings", document.readings.len());

        let collected_at = Utc::now();
        let metrics = document
            .readings
            .into_iter()
            .map(|reading| Metric {
                device_id: device.id,
                device_type: device.device_type.clone(),
                room_id: device.room_id,
                metric_type: reading.metric_type,
                value: reading.value,
                unit: reading.unit,
                collected_at,
                status: MetricStatus::Normal,
            })
            .collect();

        Ok(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn device_for(mock_uri: &str) -> Device {
        let mock_url = url::Url::parse(mock_uri).unwrap();
        Device {
            id: 42,
            code: "SRV-B02-11".to_string(),
            name: "rack server".to_string(),
            device_type: "SERVER".to_string(),
            protocol: "http".to_string(),
            room_id: Some(2),
            address: mock_url.host_str().unwrap().to_string(),
            port: mock_url.port().unwrap(),
            token: None,
        }
    }

    fn http_config() -> MonitorConfig {
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

    #[tokio::test]
    async fn parses_readings_into_metrics() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readings"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "readings": [
                    {"metric_type": "cpu_usage", "value": 45.5, "unit": "%"},
                    {"metric_type": "temperature", "value": 38.0, "unit": "°C"}
                ]
            })))
            .mount(&mock_server)
            .await;

        let collector = HttpCollector::new();
        let metrics = collector
            .collect(&device_for(&mock_server.uri()), &http_config())
            .await
            .unwrap();

        assert_eq!(metrics.len(), 2);
        assert_eq!(metrics[0].metric_type, "cpu_usage");
        assert_eq!(metrics[0].value, 45.5);
        assert_eq!(metrics[0].device_id, 42);
        assert_eq!(metrics[1].unit, "°C");
    }

    #[tokio::test]
    async fn custom_path_from_params() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v2/telemetry"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"readings": []})),
            )
            .mount(&mock_server)
            .await;

        let mut config = http_config();
        config.params = serde_json::json!({"path": "/api/v2/telemetry"});

        let collector = HttpCollector::new();
        let metrics = collector
            .collect(&device_for(&mock_server.uri()), &config)
            .await
            .unwrap();
        assert!(metrics.is_empty());
    }

    #[tokio::test]
    async fn secret_header_sent_when_token_set() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readings"))
            .and(header("X-MONITORING-SECRET", "hunter2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"readings": []})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let mut device = device_for(&mock_server.uri());
        device.token = Some("hunter2".to_string());

        let collector = HttpCollector::new();
        collector.collect(&device, &http_config()).await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_classified_as_auth() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readings"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&mock_server)
            .await;

        let collector = HttpCollector::new();
        let err = collector
            .collect(&device_for(&mock_server.uri()), &http_config())
            .await
            .unwrap_err();
        assert_matches!(err, CollectorError::Auth(_));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn invalid_json_classified_as_protocol() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readings"))
            .respond_with(ResponseTemplate::new(200).set_body_string("not valid json"))
            .mount(&mock_server)
            .await;

        let collector = HttpCollector::new();
        let err = collector
            .collect(&device_for(&mock_server.uri()), &http_config())
            .await
            .unwrap_err();
        assert_matches!(err, CollectorError::Protocol(_));
    }

    #[tokio::test]
    async fn connection_refused_classified_as_unreachable() {
        // Port 1 is essentially never listening
        let device = Device {
            id: 1,
            code: "SW-X".to_string(),
            name: String::new(),
            device_type: "SWITCH".to_string(),
            protocol: "http".to_string(),
            room_id: None,
            address: "127.0.0.1".to_string(),
            port: 1,
            token: None,
        };

        let collector = HttpCollector::new();
        let err = collector.collect(&device, &http_config()).await.unwrap_err();
        assert_matches!(err, CollectorError::Unreachable(_));
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn slow_endpoint_classified_as_timeout() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/readings"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"readings": []}))
                    .set_delay(Duration::from_secs(5)),
            )
            .mount(&mock_server)
            .await;

        let mut config = http_config();
        config.timeout_secs = 1;

        let collector = HttpCollector::new();
        let err = collector
            .collect(&device_for(&mock_server.uri()), &config)
            .await
            .unwrap_err();
        assert_matches!(err, CollectorError::Timeout(_));
    }
}
