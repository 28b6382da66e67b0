//! Protocol collectors and the collector registry
//!
//! A `Collector` is implemented once per wire protocol (SNMP, Modbus,
//! HTTP/script, sensor-bus) and turns a device's raw response into normalized
//! [`Metric`]s. The registry maps a protocol name to a registered collector
//! and supports add/remove at runtime; registration is in-process only, there
//! is no dynamic artifact loading.
//!
//! ## Error classification
//!
//! Collector failures are classified so the scheduler can decide whether a
//! retry on a later tick makes sense:
//!
//! - `Timeout` / `Unreachable`: transient, retryable
//! - `Protocol` (malformed response) / `Auth`: persistent, not retryable

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::config::MonitorConfig;
use crate::{Device, Metric};

pub mod http;

pub use http::HttpCollector;

/// Result type alias for collector operations
pub type CollectorResult<T> = Result<T, CollectorError>;

/// Errors that can occur while polling a device
#[derive(Debug, Clone)]
pub enum CollectorError {
    /// The device did not answer within the configured timeout
    Timeout(String),

    /// The device could not be reached at all (connect/DNS failure)
    Unreachable(String),

    /// The device answered with something the collector could not parse
    Protocol(String),

    /// The device rejected the configured credentials
    Auth(String),
}

impl CollectorError {
    /// Whether a later poll attempt is worth making
    pub fn is_retryable(&self) -> bool {
        matches!(self, CollectorError::Timeout(_) | CollectorError::Unreachable(_))
    }
}

impl fmt::Display for CollectorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CollectorError::Timeout(msg) => write!(f, "collection timed out: {}", msg),
            CollectorError::Unreachable(msg) => write!(f, "device unreachable: {}", msg),
            CollectorError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            CollectorError::Auth(msg) => write!(f, "authentication failed: {}", msg),
        }
    }
}

impl std::error::Error for CollectorError {}

/// Capability contract implemented once per protocol
///
/// A collector is a pure function of (device, config) → metrics. It must not
/// keep per-device state; per-poll state (HTTP clients, sessions) belongs to
/// the implementation and is reused across calls for efficiency.
///
/// ## Thread Safety
///
/// Implementations must be `Send + Sync`; one collector instance serves many
/// concurrent polls.
#[async_trait]
pub trait Collector: Send + Sync {
    /// Protocol name this collector serves (e.g. "http")
    fn protocol(&self) -> &str;

    /// Poll one device and return its normalized metrics
    async fn collect(&self, device: &Device, config: &MonitorConfig) -> CollectorResult<Vec<Metric>>;
}

struct Registration {
    collector: Arc<dyn Collector>,
    /// Optional JSON schema describing the collector's `params` shape
    config_schema: Option<serde_json::Value>,
}

/// Maps protocol names to registered collectors
///
/// Registering a name that already exists replaces the prior binding
/// (last-write-wins); unregistering an unbound name is a no-op.
#[derive(Clone, Default)]
pub struct CollectorRegistry {
    inner: Arc<RwLock<HashMap<String, Registration>>>,
}

impl CollectorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(
        &self,
        name: impl Into<String>,
        collector: Arc<dyn Collector>,
        config_schema: Option<serde_json::Value>,
    ) {
        let name = name.into();
        let mut map = self.inner.write().await;
        if map
            .insert(
                name.clone(),
                Registration {
                    collector,
                    config_schema,
                },
            )
            .is_some()
        {
            warn!("collector for protocol {name} replaced");
        } else {
            debug!("collector for protocol {name} registered");
        }
    }

    pub async fn unregister(&self, name: &str) {
        if self.inner.write().await.remove(name).is_some() {
            debug!("collector for protocol {name} unregistered");
        }
    }

    pub async fn get(&self, name: &str) -> Option<Arc<dyn Collector>> {
        self.inner.read().await.get(name).map(|r| r.collector.clone())
    }

    pub async fn config_schema(&self, name: &str) -> Option<serde_json::Value> {
        self.inner
            .read()
            .await
            .get(name)
            .and_then(|r| r.config_schema.clone())
    }

    pub async fn protocols(&self) -> Vec<String> {
        self.inner.read().await.keys().cloned().collect()
    }
}
