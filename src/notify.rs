//! Notification channels
//!
//! Alarm notifications fan out over three channels: DingTalk webhook, SMS
//! (critical alarms only) and email. The engine talks to all of them through
//! the [`Notifier`] trait; dispatch failures are recoverable and never roll
//! back alarm state.

use std::fmt;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{error, info, instrument};

use crate::MetricStatus;
use crate::alarm::AlarmRecord;
use crate::config::DingTalkConfig;

/// Result type alias for notification dispatch
pub type NotifyResult = Result<(), NotificationError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    DingTalk,
    Sms,
    Email,
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::DingTalk => write!(f, "dingtalk"),
            ChannelKind::Sms => write!(f, "sms"),
            ChannelKind::Email => write!(f, "email"),
        }
    }
}

/// Channel dispatch failure (recoverable; the caller may retry later)
#[derive(Debug, Clone)]
pub enum NotificationError {
    /// The channel rejected or failed to deliver the message
    DispatchFailed { channel: ChannelKind, message: String },

    /// No transport is configured for this channel
    ChannelUnavailable(ChannelKind),
}

impl fmt::Display for NotificationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NotificationError::DispatchFailed { channel, message } => {
                write!(f, "failed to dispatch {channel} notification: {message}")
            }
            NotificationError::ChannelUnavailable(channel) => {
                write!(f, "no transport configured for channel {channel}")
            }
        }
    }
}

impl std::error::Error for NotificationError {}

/// External notification collaborator
///
/// One implementation serves all channels; a channel without a configured
/// transport returns `ChannelUnavailable` so the sent flag stays false.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: ChannelKind, alarm: &AlarmRecord) -> NotifyResult;
}

/// Notifier used when no channel transport is configured; every dispatch
/// reports `ChannelUnavailable`.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullNotifier;

#[async_trait]
impl Notifier for NullNotifier {
    async fn send(&self, channel: ChannelKind, _alarm: &AlarmRecord) -> NotifyResult {
        Err(NotificationError::ChannelUnavailable(channel))
    }
}

/// DingTalk webhook notifier
///
/// Posts markdown messages to a DingTalk group robot webhook. SMS and email
/// have no transport here and report `ChannelUnavailable`.
#[derive(Debug, Clone)]
pub struct DingTalkNotifier {
    client: reqwest::Client,
    config: DingTalkConfig,
}

impl DingTalkNotifier {
    pub fn new(config: DingTalkConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }

    fn markdown_text(&self, alarm: &AlarmRecord) -> String {
        let level = match alarm.level {
            MetricStatus::Critical => "CRITICAL",
            MetricStatus::Warning => "WARNING",
            MetricStatus::Normal => "NOTICE",
        };
        let keyword = self
            .config
            .keyword
            .as_deref()
            .map(|k| format!("{k} "))
            .unwrap_or_default();

        format!(
            "### {keyword}{level} alarm #{id}\n\n- **type**: {alarm_type}\n- **device**: {device_id}\n- **detail**: {detail}\n- **raised**: {raised}",
            id = alarm.id,
            alarm_type = alarm.alarm_type,
            device_id = alarm.device_id,
            detail = alarm.detail,
            raised = alarm.created_at.to_rfc3339(),
        )
    }
}

#[async_trait]
impl Notifier for DingTalkNotifier {
    #[instrument(skip(self, alarm), fields(alarm_id = alarm.id))]
    async fn send(&self, channel: ChannelKind, alarm: &AlarmRecord) -> NotifyResult {
        if channel != ChannelKind::DingTalk {
            return Err(NotificationError::ChannelUnavailable(channel));
        }

        let payload = json!({
            "msgtype": "markdown",
            "markdown": {
                "title": format!("alarm #{}", alarm.id),
                "text": self.markdown_text(alarm),
            },
            "timestamp": Utc::now().to_rfc3339(),
        });

        match self.client.post(&self.config.url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Successfully sent DingTalk alarm notification");
                Ok(())
            }
            Ok(response) => {
                error!("DingTalk notification failed with status: {}", response.status());
                Err(NotificationError::DispatchFailed {
                    channel,
                    message: format!("HTTP {}", response.status()),
                })
            }
            Err(e) => {
                error!("Failed to send DingTalk notification: {e}");
                Err(NotificationError::DispatchFailed {
                    channel,
                    message: e.to_string(),
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alarm::AlarmStatus;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_alarm() -> AlarmRecord {
        AlarmRecord {
            id: 7,
            level: MetricStatus::Critical,
            alarm_type: "temperature".to_string(),
            device_id: 42,
            detail: "temperature 35.0°C exceeds threshold".to_string(),
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

    #[tokio::test]
    async fn posts_markdown_payload() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/robot/send"))
            .and(body_partial_json(serde_json::json!({"msgtype": "markdown"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let notifier = DingTalkNotifier::new(DingTalkConfig {
            url: format!("{}/robot/send", mock_server.uri()),
            keyword: Some("DCIM".to_string()),
        });

        notifier
            .send(ChannelKind::DingTalk, &test_alarm())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn webhook_failure_is_dispatch_error() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/robot/send"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let notifier = DingTalkNotifier::new(DingTalkConfig {
            url: format!("{}/robot/send", mock_server.uri()),
            keyword: None,
        });

        let err = notifier
            .send(ChannelKind::DingTalk, &test_alarm())
            .await
            .unwrap_err();
        assert!(matches!(err, NotificationError::DispatchFailed { .. }));
    }

    #[tokio::test]
    async fn sms_has_no_transport_here() {
        let notifier = DingTalkNotifier::new(DingTalkConfig {
            url: "http://127.0.0.1:1/robot/send".to_string(),
            keyword: None,
        });

        let err = notifier
            .send(ChannelKind::Sms, &test_alarm())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            NotificationError::ChannelUnavailable(ChannelKind::Sms)
        ));
    }

    #[test]
    fn markdown_includes_keyword_and_level() {
        let notifier = DingTalkNotifier::new(DingTalkConfig {
            url: String::new(),
            keyword: Some("DCIM".to_string()),
        });
        let text = notifier.markdown_text(&test_alarm());
        assert!(text.contains("DCIM CRITICAL"));
        assert!(text.contains("#7"));
    }
}
