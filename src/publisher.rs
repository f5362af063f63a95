//! Insights telemetry publishing.

use async_trait::async_trait;
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TelemetryLevel {
    Debug,
    Info,
    Warning,
    Error,
}

/// A single telemetry record about device or call lifecycle.
#[derive(Debug, Clone)]
pub struct TelemetryEvent {
    pub level: TelemetryLevel,
    /// Event group, for example `connection` or `get-user-media`.
    pub group: String,
    pub name: String,
    pub payload: Value,
    pub call_sid: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl TelemetryEvent {
    pub fn info(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TelemetryLevel::Info, group, name)
    }

    pub fn error(group: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(TelemetryLevel::Error, group, name)
    }

    fn new(level: TelemetryLevel, group: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            level,
            group: group.into(),
            name: name.into(),
            payload: Value::Null,
            call_sid: None,
            timestamp: chrono::Utc::now(),
        }
    }

    pub fn with_call_sid(mut self, call_sid: Option<String>) -> Self {
        self.call_sid = call_sid;
        self
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }
}

#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: TelemetryEvent);
}

/// Publisher that writes events to the log instead of a backend.
#[derive(Debug, Default)]
pub struct LogPublisher;

#[async_trait]
impl EventPublisher for LogPublisher {
    async fn publish(&self, event: TelemetryEvent) {
        let level = match event.level {
            TelemetryLevel::Debug => log::Level::Debug,
            TelemetryLevel::Info => log::Level::Info,
            TelemetryLevel::Warning => log::Level::Warn,
            TelemetryLevel::Error => log::Level::Error,
        };
        log::log!(
            target: "Publisher",
            level,
            "{}/{} call_sid={:?} payload={}",
            event.group,
            event.name,
            event.call_sid,
            event.payload
        );
    }
}
