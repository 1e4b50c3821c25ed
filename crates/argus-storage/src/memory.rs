//! In-memory repository implementations.
//!
//! Map-backed equivalents of the Postgres adapters with the same
//! arbitration semantics, used by the test suites and by embedded runs
//! that do not need durability.

use crate::repository::{
    AlertRepository, ChannelRepository, DedupeOutcome, DedupeResult, LogQuery, LogRepository,
    MetricRepository, ProjectRepository, ServiceEdge, ServiceInfo, SpanRepository,
};
use argus_common::{
    Alert, AlertChannel, AlertId, AlertType, LogId, LogRecord, MetricSample, MetricType, NewAlert,
    NewLogRecord, Project, ProjectId, Result, Span, TraceSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::Mutex;

/// Log storage in memory
#[derive(Default)]
pub struct MemoryLogRepository {
    records: Mutex<Vec<LogRecord>>,
    next_id: AtomicI64,
}

impl MemoryLogRepository {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl LogRepository for MemoryLogRepository {
    async fn insert_batch(&self, batch: &[NewLogRecord]) -> Result<Vec<LogId>> {
        let mut records = self.records.lock().await;
        let mut ids = Vec::with_capacity(batch.len());
        for record in batch {
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            records.push(LogRecord {
                id,
                timestamp: record.timestamp,
                level: record.level,
                service: record.service.clone(),
                message: record.message.clone(),
                metadata: record.metadata.clone(),
                trace_id: record.trace_id.clone(),
                span_id: record.span_id.clone(),
            });
            ids.push(id);
        }
        Ok(ids)
    }

    async fn find_by_id(&self, id: LogId) -> Result<Option<LogRecord>> {
        let records = self.records.lock().await;
        Ok(records.iter().find(|r| r.id == id).cloned())
    }

    async fn find_recent(&self, limit: i64) -> Result<Vec<LogRecord>> {
        let records = self.records.lock().await;
        let skip = records.len().saturating_sub(limit.max(0) as usize);
        Ok(records[skip..].to_vec())
    }

    async fn find_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let records = self.records.lock().await;
        let mut matching: Vec<LogRecord> = records
            .iter()
            .filter(|r| query.service.as_deref().map(|s| r.service == s).unwrap_or(true))
            .filter(|r| query.level.map(|l| r.level == l).unwrap_or(true))
            .filter(|r| query.start.map(|s| r.timestamp >= s).unwrap_or(true))
            .filter(|r| query.end.map(|e| r.timestamp < e).unwrap_or(true))
            .cloned()
            .collect();
        matching.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        matching.truncate(query.limit.clamp(1, 1000) as usize);
        Ok(matching)
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let records = self.records.lock().await;
        let mut services: HashMap<String, ServiceInfo> = HashMap::new();
        for record in records.iter() {
            let entry = services
                .entry(record.service.clone())
                .or_insert_with(|| ServiceInfo {
                    service: record.service.clone(),
                    last_seen: record.timestamp,
                    log_count: 0,
                });
            entry.log_count += 1;
            entry.last_seen = entry.last_seen.max(record.timestamp);
        }
        let mut listing: Vec<ServiceInfo> = services.into_values().collect();
        listing.sort_by(|a, b| a.service.cmp(&b.service));
        Ok(listing)
    }
}

/// Span storage in memory
#[derive(Default)]
pub struct MemorySpanRepository {
    spans: Mutex<HashMap<(String, String), Span>>,
    summaries: Mutex<HashMap<String, TraceSummary>>,
}

impl MemorySpanRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// The stored aggregate for a trace, for assertions in tests
    pub async fn trace_summary(&self, trace_id: &str) -> Option<TraceSummary> {
        self.summaries.lock().await.get(trace_id).cloned()
    }
}

#[async_trait]
impl SpanRepository for MemorySpanRepository {
    async fn insert_batch(&self, batch: &[Span]) -> Result<()> {
        let mut spans = self.spans.lock().await;
        for span in batch {
            spans.insert((span.trace_id.clone(), span.span_id.clone()), span.clone());
        }
        Ok(())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Span>> {
        let spans = self.spans.lock().await;
        let mut matching: Vec<Span> = spans
            .values()
            .filter(|s| s.trace_id == trace_id)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.start_time);
        Ok(matching)
    }

    async fn upsert_trace_summary(&self, summary: &TraceSummary) -> Result<()> {
        self.summaries
            .lock()
            .await
            .insert(summary.trace_id.clone(), summary.clone());
        Ok(())
    }

    async fn find_recent_summaries(&self, limit: i64) -> Result<Vec<TraceSummary>> {
        let summaries = self.summaries.lock().await;
        let mut listing: Vec<TraceSummary> = summaries.values().cloned().collect();
        listing.sort_by(|a, b| b.start_time.cmp(&a.start_time));
        listing.truncate(limit.max(0) as usize);
        Ok(listing)
    }

    async fn service_edges(&self, since: DateTime<Utc>) -> Result<Vec<ServiceEdge>> {
        let spans = self.spans.lock().await;
        let mut counts: HashMap<(String, String), i64> = HashMap::new();
        for child in spans.values().filter(|s| s.start_time >= since) {
            let Some(parent_id) = child.parent_span_id.as_ref() else {
                continue;
            };
            let Some(parent) = spans.get(&(child.trace_id.clone(), parent_id.clone())) else {
                continue;
            };
            if parent.service != child.service {
                *counts
                    .entry((parent.service.clone(), child.service.clone()))
                    .or_insert(0) += 1;
            }
        }
        let mut edges: Vec<ServiceEdge> = counts
            .into_iter()
            .map(|((parent_service, child_service), call_count)| ServiceEdge {
                parent_service,
                child_service,
                call_count,
            })
            .collect();
        edges.sort_by(|a, b| {
            (a.parent_service.as_str(), a.child_service.as_str())
                .cmp(&(b.parent_service.as_str(), b.child_service.as_str()))
        });
        Ok(edges)
    }
}

/// Metric sample storage in memory
#[derive(Default)]
pub struct MemoryMetricRepository {
    samples: Mutex<HashMap<(String, MetricType, i64), MetricSample>>,
}

impl MemoryMetricRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetricRepository for MemoryMetricRepository {
    async fn upsert(&self, sample: &MetricSample) -> Result<()> {
        let key = (
            sample.service.clone(),
            sample.metric_type,
            sample.window_start.timestamp(),
        );
        self.samples.lock().await.insert(key, sample.clone());
        Ok(())
    }

    async fn find_samples(
        &self,
        service: &str,
        metric_type: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let samples = self.samples.lock().await;
        let mut matching: Vec<MetricSample> = samples
            .values()
            .filter(|s| s.service == service)
            .filter(|s| metric_type.map(|m| s.metric_type == m).unwrap_or(true))
            .filter(|s| s.window_start >= start && s.window_start < end)
            .cloned()
            .collect();
        matching.sort_by_key(|s| s.window_start);
        Ok(matching)
    }
}

/// Alert storage in memory with the same dedupe arbitration as Postgres
#[derive(Default)]
pub struct MemoryAlertRepository {
    alerts: Mutex<Vec<Alert>>,
    next_id: AtomicI64,
}

impl MemoryAlertRepository {
    pub fn new() -> Self {
        Self {
            alerts: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Snapshot of every stored alert, for assertions in tests
    pub async fn all(&self) -> Vec<Alert> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl AlertRepository for MemoryAlertRepository {
    async fn insert_deduped(&self, alert: &NewAlert, time_bucket: i64) -> Result<DedupeResult> {
        let mut alerts = self.alerts.lock().await;

        if let Some(existing) = alerts.iter_mut().find(|a| {
            !a.resolved
                && a.service == alert.service
                && a.alert_type == alert.alert_type
                && a.time_bucket == time_bucket
        }) {
            if alert.severity > existing.severity {
                existing.severity = alert.severity;
                existing.message = alert.message.clone();
                return Ok(DedupeResult {
                    outcome: DedupeOutcome::Updated,
                    alert: existing.clone(),
                });
            }
            return Ok(DedupeResult {
                outcome: DedupeOutcome::Skipped,
                alert: existing.clone(),
            });
        }

        let stored = Alert {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            project_id: alert.project_id,
            alert_type: alert.alert_type,
            severity: alert.severity,
            message: alert.message.clone(),
            service: alert.service.clone(),
            resolved: false,
            created_at: alert.created_at,
            resolved_at: None,
            sent: false,
            last_sent_at: None,
            time_bucket,
        };
        alerts.push(stored.clone());
        Ok(DedupeResult {
            outcome: DedupeOutcome::Created,
            alert: stored,
        })
    }

    async fn find_unresolved_in_bucket(
        &self,
        service: &str,
        alert_type: AlertType,
        time_bucket: i64,
    ) -> Result<Option<Alert>> {
        let alerts = self.alerts.lock().await;
        Ok(alerts
            .iter()
            .find(|a| {
                !a.resolved
                    && a.service == service
                    && a.alert_type == alert_type
                    && a.time_bucket == time_bucket
            })
            .cloned())
    }

    async fn find_unsent_since(
        &self,
        service: &str,
        alert_type: AlertType,
        project_id: Option<ProjectId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let alerts = self.alerts.lock().await;
        let mut matching: Vec<Alert> = alerts
            .iter()
            .filter(|a| {
                !a.sent
                    && !a.resolved
                    && a.service == service
                    && a.alert_type == alert_type
                    && a.project_id == project_id
                    && a.created_at >= since
            })
            .cloned()
            .collect();
        matching.sort_by_key(|a| a.created_at);
        Ok(matching)
    }

    async fn mark_sent(&self, ids: &[AlertId], at: DateTime<Utc>) -> Result<()> {
        let mut alerts = self.alerts.lock().await;
        for alert in alerts.iter_mut() {
            if ids.contains(&alert.id) {
                alert.sent = true;
                alert.last_sent_at = Some(at);
            }
        }
        Ok(())
    }

    async fn find_recent(&self, limit: i64) -> Result<Vec<Alert>> {
        let alerts = self.alerts.lock().await;
        let mut listing: Vec<Alert> = alerts.clone();
        listing.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        listing.truncate(limit.max(0) as usize);
        Ok(listing)
    }

    async fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> Result<bool> {
        let mut alerts = self.alerts.lock().await;
        match alerts.iter_mut().find(|a| a.id == id && !a.resolved) {
            Some(alert) => {
                alert.resolved = true;
                alert.resolved_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

/// Alert channel storage in memory
#[derive(Default)]
pub struct MemoryChannelRepository {
    channels: Mutex<Vec<AlertChannel>>,
}

impl MemoryChannelRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add(&self, channel: AlertChannel) {
        self.channels.lock().await.push(channel);
    }
}

#[async_trait]
impl ChannelRepository for MemoryChannelRepository {
    async fn find_active_for_project(&self, project_id: ProjectId) -> Result<Vec<AlertChannel>> {
        let channels = self.channels.lock().await;
        Ok(channels
            .iter()
            .filter(|c| c.project_id == project_id && c.active)
            .cloned()
            .collect())
    }
}

/// Project storage in memory
#[derive(Default)]
pub struct MemoryProjectRepository {
    projects: Mutex<HashMap<ProjectId, Project>>,
    bindings: Mutex<HashMap<String, ProjectId>>,
}

impl MemoryProjectRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_project(&self, project: Project) {
        self.projects.lock().await.insert(project.id, project);
    }
}

#[async_trait]
impl ProjectRepository for MemoryProjectRepository {
    async fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>> {
        Ok(self.projects.lock().await.get(&id).cloned())
    }

    async fn resolve_service_project(&self, service: &str) -> Result<Option<ProjectId>> {
        Ok(self.bindings.lock().await.get(service).copied())
    }

    async fn touch_service_binding(&self, service: &str, project_id: ProjectId) -> Result<()> {
        self.bindings
            .lock()
            .await
            .insert(service.to_string(), project_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_common::AlertSeverity;
    use std::sync::Arc;

    fn spike(service: &str, severity: AlertSeverity) -> NewAlert {
        NewAlert {
            alert_type: AlertType::ErrorSpike,
            severity,
            message: format!("{} spike at {:?}", service, severity),
            service: service.to_string(),
            created_at: Utc::now(),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn dedupe_created_then_updated_then_skipped() {
        let repo = MemoryAlertRepository::new();

        let first = repo
            .insert_deduped(&spike("svc", AlertSeverity::Medium), 100)
            .await
            .unwrap();
        assert_eq!(first.outcome, DedupeOutcome::Created);

        let higher = repo
            .insert_deduped(&spike("svc", AlertSeverity::Critical), 100)
            .await
            .unwrap();
        assert_eq!(higher.outcome, DedupeOutcome::Updated);
        assert_eq!(higher.alert.id, first.alert.id);
        assert_eq!(higher.alert.severity, AlertSeverity::Critical);

        let lower = repo
            .insert_deduped(&spike("svc", AlertSeverity::High), 100)
            .await
            .unwrap();
        assert_eq!(lower.outcome, DedupeOutcome::Skipped);
        assert_eq!(lower.alert.severity, AlertSeverity::Critical);

        assert_eq!(repo.all().await.len(), 1);
    }

    #[tokio::test]
    async fn dedupe_keys_are_independent() {
        let repo = MemoryAlertRepository::new();
        repo.insert_deduped(&spike("svc", AlertSeverity::Low), 100)
            .await
            .unwrap();
        // Different bucket and different service both create fresh rows.
        repo.insert_deduped(&spike("svc", AlertSeverity::Low), 101)
            .await
            .unwrap();
        repo.insert_deduped(&spike("other", AlertSeverity::Low), 100)
            .await
            .unwrap();
        assert_eq!(repo.all().await.len(), 3);
        assert_eq!(repo.find_recent(2).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_dedupe_keeps_max_severity() {
        let repo = Arc::new(MemoryAlertRepository::new());
        let severities = [
            AlertSeverity::Low,
            AlertSeverity::Critical,
            AlertSeverity::Medium,
            AlertSeverity::High,
            AlertSeverity::Medium,
            AlertSeverity::Low,
        ];

        let mut tasks = Vec::new();
        for severity in severities {
            let repo = repo.clone();
            tasks.push(tokio::spawn(async move {
                repo.insert_deduped(&spike("svc", severity), 42).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let alerts = repo.all().await;
        assert_eq!(alerts.len(), 1, "one stored alert per dedupe key");
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn unsent_queries_and_mark_sent() {
        let repo = MemoryAlertRepository::new();
        let start = Utc::now();

        let a = repo
            .insert_deduped(&spike("svc", AlertSeverity::Medium), 1)
            .await
            .unwrap();
        let b = repo
            .insert_deduped(&spike("svc", AlertSeverity::Medium), 2)
            .await
            .unwrap();

        let unsent = repo
            .find_unsent_since(
                "svc",
                AlertType::ErrorSpike,
                None,
                start - chrono::Duration::minutes(5),
            )
            .await
            .unwrap();
        assert_eq!(unsent.len(), 2);

        repo.mark_sent(&[a.alert.id, b.alert.id], Utc::now())
            .await
            .unwrap();
        let unsent = repo
            .find_unsent_since(
                "svc",
                AlertType::ErrorSpike,
                None,
                start - chrono::Duration::minutes(5),
            )
            .await
            .unwrap();
        assert!(unsent.is_empty());
        assert!(repo.all().await.iter().all(|a| a.sent && a.last_sent_at.is_some()));
    }

    #[tokio::test]
    async fn resolving_frees_the_dedupe_key() {
        let repo = MemoryAlertRepository::new();
        let first = repo
            .insert_deduped(&spike("svc", AlertSeverity::High), 7)
            .await
            .unwrap();
        assert_eq!(first.outcome, DedupeOutcome::Created);

        assert!(repo.resolve(first.alert.id, Utc::now()).await.unwrap());
        // Resolving again reports nothing to do.
        assert!(!repo.resolve(first.alert.id, Utc::now()).await.unwrap());

        // The key is free: the same (service, type, bucket) creates anew.
        let second = repo
            .insert_deduped(&spike("svc", AlertSeverity::Low), 7)
            .await
            .unwrap();
        assert_eq!(second.outcome, DedupeOutcome::Created);
        assert_ne!(second.alert.id, first.alert.id);
    }

    #[tokio::test]
    async fn log_queries_filter_and_order() {
        let repo = MemoryLogRepository::new();
        let base = Utc::now();
        let mut batch = Vec::new();
        for (i, (service, level)) in [
            ("api", argus_common::LogLevel::Info),
            ("api", argus_common::LogLevel::Error),
            ("worker", argus_common::LogLevel::Info),
        ]
        .iter()
        .enumerate()
        {
            batch.push(NewLogRecord {
                timestamp: base + chrono::Duration::seconds(i as i64),
                level: *level,
                service: service.to_string(),
                message: format!("m{}", i),
                metadata: HashMap::new(),
                trace_id: None,
                span_id: None,
            });
        }
        repo.insert_batch(&batch).await.unwrap();

        let api_logs = repo
            .find_logs(&LogQuery {
                service: Some("api".to_string()),
                limit: 100,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(api_logs.len(), 2);
        // Newest first.
        assert!(api_logs[0].timestamp > api_logs[1].timestamp);

        let errors = repo
            .find_logs(&LogQuery {
                level: Some(argus_common::LogLevel::Error),
                limit: 100,
                ..LogQuery::default()
            })
            .await
            .unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].service, "api");

        let services = repo.list_services().await.unwrap();
        assert_eq!(services.len(), 2);
        assert_eq!(services[0].service, "api");
        assert_eq!(services[0].log_count, 2);
        assert_eq!(services[1].service, "worker");
    }

    #[tokio::test]
    async fn service_edges_follow_parent_links() {
        use argus_common::{Span, SpanKind, SpanStatus};
        let repo = MemorySpanRepository::new();
        let now = Utc::now();
        let trace = "f".repeat(32);

        let span = |id: &str, parent: Option<&str>, service: &str| Span {
            trace_id: trace.clone(),
            span_id: id.to_string(),
            parent_span_id: parent.map(|p| p.to_string()),
            name: "op".to_string(),
            kind: SpanKind::Server,
            service: service.to_string(),
            start_time: now,
            end_time: None,
            duration_ms: None,
            status: SpanStatus::Ok,
            attributes: HashMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        };

        repo.insert_batch(&[
            span(&"1".repeat(16), None, "gateway"),
            span(&"2".repeat(16), Some(&"1".repeat(16)), "billing"),
            span(&"3".repeat(16), Some(&"1".repeat(16)), "billing"),
            // Same-service parent/child edges are not part of the map.
            span(&"4".repeat(16), Some(&"2".repeat(16)), "billing"),
        ])
        .await
        .unwrap();

        let edges = repo
            .service_edges(now - chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].parent_service, "gateway");
        assert_eq!(edges[0].child_service, "billing");
        assert_eq!(edges[0].call_count, 2);
    }

    #[tokio::test]
    async fn recent_logs_come_back_in_ascending_order() {
        let repo = MemoryLogRepository::new();
        let mut batch = Vec::new();
        for i in 0..5 {
            batch.push(NewLogRecord {
                timestamp: Utc::now(),
                level: argus_common::LogLevel::Info,
                service: "svc".to_string(),
                message: format!("m{}", i),
                metadata: HashMap::new(),
                trace_id: None,
                span_id: None,
            });
        }
        let ids = repo.insert_batch(&batch).await.unwrap();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);

        let recent = repo.find_recent(3).await.unwrap();
        let recent_ids: Vec<LogId> = recent.iter().map(|r| r.id).collect();
        assert_eq!(recent_ids, vec![3, 4, 5]);
    }
}
