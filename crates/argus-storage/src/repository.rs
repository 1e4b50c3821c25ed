//! Repository capabilities owned by the storage layer.
//!
//! Every trait here is a seam: the processor takes `Arc<dyn …>` so tests
//! run on the in-memory adapters and production runs on Postgres.

use argus_common::{
    Alert, AlertChannel, AlertId, AlertType, LogId, LogLevel, LogRecord, MetricSample, MetricType,
    NewAlert, NewLogRecord, Project, ProjectId, Result, Span, TraceSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// Filter for log reads. `limit` is clamped by the HTTP surface to 1..1000.
#[derive(Debug, Clone, Default)]
pub struct LogQuery {
    pub service: Option<String>,
    pub level: Option<LogLevel>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: i64,
}

/// A known service and when it last logged
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceInfo {
    pub service: String,
    pub last_seen: DateTime<Utc>,
    pub log_count: i64,
}

/// One directed parent -> child call edge in the service map
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceEdge {
    pub parent_service: String,
    pub child_service: String,
    pub call_count: i64,
}

/// How a deduplicated insert resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DedupeOutcome {
    /// No unresolved alert existed for the key; a new row was created
    Created,
    /// An unresolved alert existed with strictly lower severity; severity
    /// and message were replaced
    Updated,
    /// An unresolved alert existed with equal or higher severity
    Skipped,
}

/// Outcome of `AlertRepository::insert_deduped`
#[derive(Debug, Clone)]
pub struct DedupeResult {
    pub outcome: DedupeOutcome,
    pub alert: Alert,
}

/// Durable storage for log records
#[async_trait]
pub trait LogRepository: Send + Sync {
    /// Persist a batch atomically, returning assigned ids in input order
    async fn insert_batch(&self, records: &[NewLogRecord]) -> Result<Vec<LogId>>;

    async fn find_by_id(&self, id: LogId) -> Result<Option<LogRecord>>;

    /// The most recent `limit` records in ascending id order, for the
    /// listener's catch-up pass
    async fn find_recent(&self, limit: i64) -> Result<Vec<LogRecord>>;

    /// Filtered read for the query surface, newest first
    async fn find_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>>;

    /// Every service that has logged, with last-seen time and volume
    async fn list_services(&self) -> Result<Vec<ServiceInfo>>;
}

/// Durable storage for spans and per-trace aggregates
#[async_trait]
pub trait SpanRepository: Send + Sync {
    async fn insert_batch(&self, spans: &[Span]) -> Result<()>;

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Span>>;

    async fn upsert_trace_summary(&self, summary: &TraceSummary) -> Result<()>;

    /// The most recently started traces, newest first
    async fn find_recent_summaries(&self, limit: i64) -> Result<Vec<TraceSummary>>;

    /// Directed cross-service call edges derived from parent/child spans
    /// started since `since`, for the service map
    async fn service_edges(&self, since: DateTime<Utc>) -> Result<Vec<ServiceEdge>>;
}

/// Durable storage for windowed metric samples
#[async_trait]
pub trait MetricRepository: Send + Sync {
    /// Insert or overwrite the sample at (service, metric_type,
    /// window_start)
    async fn upsert(&self, sample: &MetricSample) -> Result<()>;

    async fn find_samples(
        &self,
        service: &str,
        metric_type: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>>;
}

/// Durable storage for alerts, including the dedupe arbitration
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Atomic upsert against the unresolved-alert unique key
    /// (service, alert_type, time_bucket). Severity only ever increases.
    async fn insert_deduped(&self, alert: &NewAlert, time_bucket: i64) -> Result<DedupeResult>;

    /// The unresolved alert holding the key, if any
    async fn find_unresolved_in_bucket(
        &self,
        service: &str,
        alert_type: AlertType,
        time_bucket: i64,
    ) -> Result<Option<Alert>>;

    /// Unsent, unresolved alerts for the key since `since`, oldest first
    async fn find_unsent_since(
        &self,
        service: &str,
        alert_type: AlertType,
        project_id: Option<ProjectId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>>;

    /// Mark alerts delivered
    async fn mark_sent(&self, ids: &[AlertId], at: DateTime<Utc>) -> Result<()>;

    /// The most recently created alerts, newest first
    async fn find_recent(&self, limit: i64) -> Result<Vec<Alert>>;

    /// Resolve an alert, freeing its dedupe key. Returns false when the
    /// alert does not exist or was already resolved.
    async fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> Result<bool>;
}

/// Alert channel configuration reads
#[async_trait]
pub trait ChannelRepository: Send + Sync {
    async fn find_active_for_project(&self, project_id: ProjectId) -> Result<Vec<AlertChannel>>;
}

/// Project lookups and the service -> project binding maintained by ingest
#[async_trait]
pub trait ProjectRepository: Send + Sync {
    async fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>>;

    /// Project most recently associated with the service via an API key
    async fn resolve_service_project(&self, service: &str) -> Result<Option<ProjectId>>;

    /// Refresh the most-recently-used binding for a service
    async fn touch_service_binding(&self, service: &str, project_id: ProjectId) -> Result<()>;
}
