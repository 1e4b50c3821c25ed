//! Core data model for the Argus observability pipeline

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Monotonic identifier assigned to a persisted log record
pub type LogId = i64;

/// Identifier assigned to a persisted alert
pub type AlertId = i64;

/// Identifier for a project owning services and alert channels
pub type ProjectId = Uuid;

/// Severity level of a log record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
}

impl LogLevel {
    /// Whether this level counts toward the error rate
    pub fn is_error(&self) -> bool {
        matches!(self, LogLevel::Error | LogLevel::Fatal)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "DEBUG",
            LogLevel::Info => "INFO",
            LogLevel::Warn => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Fatal => "FATAL",
        }
    }
}

/// A log record as submitted by an instrumented service, before persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewLogRecord {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    #[serde(default)]
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

/// A persisted log record. Immutable once stored; broadcast by the
/// change-notification channel exactly once per id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: LogId,
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub service: String,
    pub message: String,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
}

impl LogRecord {
    /// Extract the `latency` metadata field in milliseconds.
    ///
    /// Non-numeric, non-finite and non-positive values are treated as
    /// absent.
    pub fn latency_ms(&self) -> Option<f64> {
        self.metadata
            .get("latency")
            .and_then(|v| v.as_f64())
            .filter(|v| v.is_finite() && *v > 0.0)
    }
}

/// Role a span plays in a trace
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanKind {
    Server,
    Client,
    Producer,
    Consumer,
    Internal,
}

impl SpanKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanKind::Server => "SERVER",
            SpanKind::Client => "CLIENT",
            SpanKind::Producer => "PRODUCER",
            SpanKind::Consumer => "CONSUMER",
            SpanKind::Internal => "INTERNAL",
        }
    }
}

/// Terminal status of a span
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpanStatus {
    Ok,
    Error,
    Unset,
}

impl SpanStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpanStatus::Ok => "OK",
            SpanStatus::Error => "ERROR",
            SpanStatus::Unset => "UNSET",
        }
    }
}

/// A timestamped event attached to a span
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// A link from a span to another span, possibly in a different trace
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpanLink {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// A single span of a distributed trace. (trace_id, span_id) is unique;
/// a null parent_span_id marks the trace root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
    pub name: String,
    pub kind: SpanKind,
    pub service: String,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    pub status: SpanStatus,
    #[serde(default)]
    pub attributes: HashMap<String, serde_json::Value>,
    #[serde(default)]
    pub events: Vec<SpanEvent>,
    #[serde(default)]
    pub links: Vec<SpanLink>,
}

/// Per-trace aggregate maintained as an upsert on span ingest.
///
/// Duration is max(end_time) - min(start_time) over the trace's spans;
/// error_count counts spans with status ERROR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceSummary {
    pub trace_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_span_id: Option<String>,
    pub span_count: u32,
    pub error_count: u32,
    pub start_time: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<f64>,
    #[serde(default)]
    pub services: Vec<String>,
}

/// Kind of windowed metric emitted by the aggregator
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricType {
    LogCount,
    ErrorCount,
    LatencyP95,
    Throughput,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::LogCount => "LOG_COUNT",
            MetricType::ErrorCount => "ERROR_COUNT",
            MetricType::LatencyP95 => "LATENCY_P95",
            MetricType::Throughput => "THROUGHPUT",
        }
    }
}

/// One windowed metric value for a service.
///
/// Keyed by (service, metric_type, window_start). Partial samples for an
/// open window may be overwritten; a finalized sample is immutable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricSample {
    pub service: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
}

/// Category of an emitted alert
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    ErrorSpike,
    HighLatency,
    ServiceDown,
    ThresholdExceeded,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::ErrorSpike => "ERROR_SPIKE",
            AlertType::HighLatency => "HIGH_LATENCY",
            AlertType::ServiceDown => "SERVICE_DOWN",
            AlertType::ThresholdExceeded => "THRESHOLD_EXCEEDED",
        }
    }
}

/// Alert severity. Ordering is significant: dedupe merges keep the maximum.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
            AlertSeverity::Critical => "CRITICAL",
        }
    }
}

/// An alert before persistence
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewAlert {
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub service: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
}

/// A persisted alert.
///
/// (service, alert_type, time_bucket) is unique among unresolved alerts.
/// Severity is monotonically non-decreasing under dedupe merges.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: AlertId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<ProjectId>,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub service: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    pub sent: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_sent_at: Option<DateTime<Utc>>,
    pub time_bucket: i64,
}

/// Delivery configuration for an alert channel, tagged by kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChannelConfig {
    ChatWebhook { url: String },
    Email { address: String },
}

/// A configured alert delivery channel for a project
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertChannel {
    pub id: Uuid,
    pub project_id: ProjectId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_filter: Option<String>,
    pub active: bool,
    pub config: ChannelConfig,
}

impl AlertChannel {
    /// Whether this channel should receive alerts for the given service
    pub fn matches_service(&self, service: &str) -> bool {
        self.active
            && self
                .service_filter
                .as_deref()
                .map(|f| f == service)
                .unwrap_or(true)
    }
}

/// A project owning services, API keys and alert channels
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner_email: Option<String>,
}

/// A per-record rejection from a batch ingest
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IngestError {
    pub index: usize,
    pub reason: String,
}

/// Outcome of a log batch ingest
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IngestReport {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IngestError>,
}

/// Outcome of a span batch ingest
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SpanIngestReport {
    pub accepted: usize,
    pub rejected: usize,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<IngestError>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn severity_ordering_is_total() {
        assert!(AlertSeverity::Low < AlertSeverity::Medium);
        assert!(AlertSeverity::Medium < AlertSeverity::High);
        assert!(AlertSeverity::High < AlertSeverity::Critical);
        assert_eq!(
            AlertSeverity::High.max(AlertSeverity::Medium),
            AlertSeverity::High
        );
    }

    #[test]
    fn log_level_wire_format_is_uppercase() {
        let level: LogLevel = serde_json::from_str("\"ERROR\"").unwrap();
        assert!(level.is_error());
        assert_eq!(serde_json::to_string(&LogLevel::Warn).unwrap(), "\"WARN\"");
    }

    #[test]
    fn latency_metadata_ignores_junk() {
        let mut metadata = HashMap::new();
        metadata.insert("latency".to_string(), serde_json::json!(123.5));
        let record = LogRecord {
            id: 1,
            timestamp: Utc::now(),
            level: LogLevel::Info,
            service: "svc".to_string(),
            message: "ok".to_string(),
            metadata: metadata.clone(),
            trace_id: None,
            span_id: None,
        };
        assert_eq!(record.latency_ms(), Some(123.5));

        let mut record = record;
        record.metadata.insert("latency".to_string(), serde_json::json!("fast"));
        assert_eq!(record.latency_ms(), None);
        record.metadata.insert("latency".to_string(), serde_json::json!(-5.0));
        assert_eq!(record.latency_ms(), None);
        record.metadata.insert("latency".to_string(), serde_json::json!(f64::NAN));
        assert_eq!(record.latency_ms(), None);
    }

    #[test]
    fn channel_service_filter() {
        let channel = AlertChannel {
            id: Uuid::new_v4(),
            project_id: Uuid::new_v4(),
            name: None,
            service_filter: Some("payments".to_string()),
            active: true,
            config: ChannelConfig::ChatWebhook {
                url: "https://hooks.example.com/x".to_string(),
            },
        };
        assert!(channel.matches_service("payments"));
        assert!(!channel.matches_service("checkout"));

        let mut inactive = channel.clone();
        inactive.active = false;
        assert!(!inactive.matches_service("payments"));
    }
}
