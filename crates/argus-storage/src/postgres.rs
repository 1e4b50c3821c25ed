//! Postgres implementations of the repository capabilities.
//!
//! Uses the runtime query API over a shared `PgPool`; row mapping happens
//! at this boundary and database errors translate into the workspace error
//! taxonomy (unique violations become `Error::Conflict`, everything else
//! `Error::Storage`).

use crate::repository::{
    AlertRepository, ChannelRepository, DedupeOutcome, DedupeResult, LogQuery, LogRepository,
    MetricRepository, ProjectRepository, ServiceEdge, ServiceInfo, SpanRepository,
};
use argus_common::config::StorageConfig;
use argus_common::{
    Alert, AlertChannel, AlertId, AlertSeverity, AlertType, ChannelConfig, Error, LogId, LogLevel,
    LogRecord, MetricSample, MetricType, NewAlert, NewLogRecord, Project, ProjectId, Result, Span,
    SpanKind, SpanStatus, TraceSummary,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions, PgRow};
use sqlx::Row;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

/// Open a connection pool against the configured database
pub async fn connect(config: &StorageConfig) -> Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(Duration::from_millis(config.acquire_timeout_ms))
        .connect(&config.database_url)
        .await
        .map_err(|e| Error::Storage(format!("failed to connect to database: {}", e)))
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    info!("running database migrations");
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Storage(format!("migration failed: {}", e)))?;
    Ok(())
}

fn db_err(context: &str, e: sqlx::Error) -> Error {
    if let sqlx::Error::Database(ref db) = e {
        if db.code().as_deref() == Some("23505") {
            return Error::Conflict(format!("{}: {}", context, db.message()));
        }
    }
    Error::Storage(format!("{}: {}", context, e))
}

fn row_err(context: &str, e: sqlx::Error) -> Error {
    Error::Storage(format!("{}: bad row: {}", context, e))
}

fn parse_level(raw: &str) -> Result<LogLevel> {
    match raw {
        "DEBUG" => Ok(LogLevel::Debug),
        "INFO" => Ok(LogLevel::Info),
        "WARN" => Ok(LogLevel::Warn),
        "ERROR" => Ok(LogLevel::Error),
        "FATAL" => Ok(LogLevel::Fatal),
        other => Err(Error::Invariant(format!("unknown log level {:?}", other))),
    }
}

fn parse_kind(raw: &str) -> Result<SpanKind> {
    match raw {
        "SERVER" => Ok(SpanKind::Server),
        "CLIENT" => Ok(SpanKind::Client),
        "PRODUCER" => Ok(SpanKind::Producer),
        "CONSUMER" => Ok(SpanKind::Consumer),
        "INTERNAL" => Ok(SpanKind::Internal),
        other => Err(Error::Invariant(format!("unknown span kind {:?}", other))),
    }
}

fn parse_status(raw: &str) -> Result<SpanStatus> {
    match raw {
        "OK" => Ok(SpanStatus::Ok),
        "ERROR" => Ok(SpanStatus::Error),
        "UNSET" => Ok(SpanStatus::Unset),
        other => Err(Error::Invariant(format!("unknown span status {:?}", other))),
    }
}

fn parse_metric_type(raw: &str) -> Result<MetricType> {
    match raw {
        "LOG_COUNT" => Ok(MetricType::LogCount),
        "ERROR_COUNT" => Ok(MetricType::ErrorCount),
        "LATENCY_P95" => Ok(MetricType::LatencyP95),
        "THROUGHPUT" => Ok(MetricType::Throughput),
        other => Err(Error::Invariant(format!("unknown metric type {:?}", other))),
    }
}

fn parse_alert_type(raw: &str) -> Result<AlertType> {
    match raw {
        "ERROR_SPIKE" => Ok(AlertType::ErrorSpike),
        "HIGH_LATENCY" => Ok(AlertType::HighLatency),
        "SERVICE_DOWN" => Ok(AlertType::ServiceDown),
        "THRESHOLD_EXCEEDED" => Ok(AlertType::ThresholdExceeded),
        other => Err(Error::Invariant(format!("unknown alert type {:?}", other))),
    }
}

fn parse_severity(raw: &str) -> Result<AlertSeverity> {
    match raw {
        "LOW" => Ok(AlertSeverity::Low),
        "MEDIUM" => Ok(AlertSeverity::Medium),
        "HIGH" => Ok(AlertSeverity::High),
        "CRITICAL" => Ok(AlertSeverity::Critical),
        other => Err(Error::Invariant(format!("unknown severity {:?}", other))),
    }
}

fn metadata_map(value: serde_json::Value) -> HashMap<String, serde_json::Value> {
    match value {
        serde_json::Value::Object(map) => map.into_iter().collect(),
        _ => HashMap::new(),
    }
}

fn log_from_row(row: &PgRow) -> Result<LogRecord> {
    let level: String = row.try_get("level").map_err(|e| row_err("logs", e))?;
    let metadata: serde_json::Value = row.try_get("metadata").map_err(|e| row_err("logs", e))?;
    Ok(LogRecord {
        id: row.try_get("id").map_err(|e| row_err("logs", e))?,
        timestamp: row.try_get("timestamp").map_err(|e| row_err("logs", e))?,
        level: parse_level(&level)?,
        service: row.try_get("service").map_err(|e| row_err("logs", e))?,
        message: row.try_get("message").map_err(|e| row_err("logs", e))?,
        metadata: metadata_map(metadata),
        trace_id: row.try_get("trace_id").map_err(|e| row_err("logs", e))?,
        span_id: row.try_get("span_id").map_err(|e| row_err("logs", e))?,
    })
}

fn span_from_row(row: &PgRow) -> Result<Span> {
    let kind: String = row.try_get("kind").map_err(|e| row_err("spans", e))?;
    let status: String = row.try_get("status").map_err(|e| row_err("spans", e))?;
    let attributes: serde_json::Value =
        row.try_get("attributes").map_err(|e| row_err("spans", e))?;
    let events: serde_json::Value = row.try_get("events").map_err(|e| row_err("spans", e))?;
    let links: serde_json::Value = row.try_get("links").map_err(|e| row_err("spans", e))?;
    Ok(Span {
        trace_id: row.try_get("trace_id").map_err(|e| row_err("spans", e))?,
        span_id: row.try_get("span_id").map_err(|e| row_err("spans", e))?,
        parent_span_id: row
            .try_get("parent_span_id")
            .map_err(|e| row_err("spans", e))?,
        name: row.try_get("name").map_err(|e| row_err("spans", e))?,
        kind: parse_kind(&kind)?,
        service: row.try_get("service").map_err(|e| row_err("spans", e))?,
        start_time: row.try_get("start_time").map_err(|e| row_err("spans", e))?,
        end_time: row.try_get("end_time").map_err(|e| row_err("spans", e))?,
        duration_ms: row.try_get("duration_ms").map_err(|e| row_err("spans", e))?,
        status: parse_status(&status)?,
        attributes: metadata_map(attributes),
        events: serde_json::from_value(events)?,
        links: serde_json::from_value(links)?,
    })
}

fn summary_from_row(row: &PgRow) -> Result<TraceSummary> {
    let span_count: i32 = row
        .try_get("span_count")
        .map_err(|e| row_err("trace_summaries", e))?;
    let error_count: i32 = row
        .try_get("error_count")
        .map_err(|e| row_err("trace_summaries", e))?;
    let services: serde_json::Value = row
        .try_get("services")
        .map_err(|e| row_err("trace_summaries", e))?;
    Ok(TraceSummary {
        trace_id: row
            .try_get("trace_id")
            .map_err(|e| row_err("trace_summaries", e))?,
        root_span_id: row
            .try_get("root_span_id")
            .map_err(|e| row_err("trace_summaries", e))?,
        span_count: span_count.max(0) as u32,
        error_count: error_count.max(0) as u32,
        start_time: row
            .try_get("start_time")
            .map_err(|e| row_err("trace_summaries", e))?,
        end_time: row
            .try_get("end_time")
            .map_err(|e| row_err("trace_summaries", e))?,
        duration_ms: row
            .try_get("duration_ms")
            .map_err(|e| row_err("trace_summaries", e))?,
        services: serde_json::from_value(services)?,
    })
}

fn alert_from_row(row: &PgRow) -> Result<Alert> {
    let alert_type: String = row.try_get("alert_type").map_err(|e| row_err("alerts", e))?;
    let severity: String = row.try_get("severity").map_err(|e| row_err("alerts", e))?;
    Ok(Alert {
        id: row.try_get("id").map_err(|e| row_err("alerts", e))?,
        project_id: row.try_get("project_id").map_err(|e| row_err("alerts", e))?,
        alert_type: parse_alert_type(&alert_type)?,
        severity: parse_severity(&severity)?,
        message: row.try_get("message").map_err(|e| row_err("alerts", e))?,
        service: row.try_get("service").map_err(|e| row_err("alerts", e))?,
        resolved: row.try_get("resolved").map_err(|e| row_err("alerts", e))?,
        created_at: row.try_get("created_at").map_err(|e| row_err("alerts", e))?,
        resolved_at: row
            .try_get("resolved_at")
            .map_err(|e| row_err("alerts", e))?,
        sent: row.try_get("sent").map_err(|e| row_err("alerts", e))?,
        last_sent_at: row
            .try_get("last_sent_at")
            .map_err(|e| row_err("alerts", e))?,
        time_bucket: row.try_get("time_bucket").map_err(|e| row_err("alerts", e))?,
    })
}

/// Log storage on Postgres
#[derive(Clone)]
pub struct PostgresLogRepository {
    pool: PgPool,
}

impl PostgresLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LogRepository for PostgresLogRepository {
    async fn insert_batch(&self, records: &[NewLogRecord]) -> Result<Vec<LogId>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin log batch", e))?;

        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            let metadata = serde_json::to_value(&record.metadata)?;
            let id: i64 = sqlx::query_scalar(
                r#"
                INSERT INTO logs (timestamp, level, service, message, metadata, trace_id, span_id)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                RETURNING id
                "#,
            )
            .bind(record.timestamp)
            .bind(record.level.as_str())
            .bind(&record.service)
            .bind(&record.message)
            .bind(metadata)
            .bind(&record.trace_id)
            .bind(&record.span_id)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| db_err("insert log", e))?;
            ids.push(id);
        }

        tx.commit().await.map_err(|e| db_err("commit log batch", e))?;
        debug!(count = ids.len(), "log batch committed");
        Ok(ids)
    }

    async fn find_by_id(&self, id: LogId) -> Result<Option<LogRecord>> {
        let row = sqlx::query("SELECT * FROM logs WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("find log by id", e))?;
        row.as_ref().map(log_from_row).transpose()
    }

    async fn find_recent(&self, limit: i64) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query("SELECT * FROM logs ORDER BY id DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("find recent logs", e))?;
        let mut records = rows
            .iter()
            .map(log_from_row)
            .collect::<Result<Vec<_>>>()?;
        records.reverse();
        Ok(records)
    }

    async fn find_logs(&self, query: &LogQuery) -> Result<Vec<LogRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM logs
            WHERE ($1::text IS NULL OR service = $1)
              AND ($2::text IS NULL OR level = $2)
              AND ($3::timestamptz IS NULL OR timestamp >= $3)
              AND ($4::timestamptz IS NULL OR timestamp < $4)
            ORDER BY timestamp DESC
            LIMIT $5
            "#,
        )
        .bind(query.service.as_deref())
        .bind(query.level.map(|l| l.as_str()))
        .bind(query.start)
        .bind(query.end)
        .bind(query.limit.clamp(1, 1000))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("find logs", e))?;
        rows.iter().map(log_from_row).collect()
    }

    async fn list_services(&self) -> Result<Vec<ServiceInfo>> {
        let rows = sqlx::query(
            r#"
            SELECT service, MAX(timestamp) AS last_seen, COUNT(*) AS log_count
            FROM logs
            GROUP BY service
            ORDER BY service
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("list services", e))?;

        rows.iter()
            .map(|row| {
                Ok(ServiceInfo {
                    service: row.try_get("service").map_err(|e| row_err("logs", e))?,
                    last_seen: row.try_get("last_seen").map_err(|e| row_err("logs", e))?,
                    log_count: row.try_get("log_count").map_err(|e| row_err("logs", e))?,
                })
            })
            .collect()
    }
}

/// Span and trace-aggregate storage on Postgres
#[derive(Clone)]
pub struct PostgresSpanRepository {
    pool: PgPool,
}

impl PostgresSpanRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SpanRepository for PostgresSpanRepository {
    async fn insert_batch(&self, spans: &[Span]) -> Result<()> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_err("begin span batch", e))?;

        for span in spans {
            sqlx::query(
                r#"
                INSERT INTO spans (
                    trace_id, span_id, parent_span_id, name, kind, service,
                    start_time, end_time, duration_ms, status, attributes, events, links
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (trace_id, span_id) DO UPDATE SET
                    end_time = EXCLUDED.end_time,
                    duration_ms = EXCLUDED.duration_ms,
                    status = EXCLUDED.status,
                    attributes = EXCLUDED.attributes,
                    events = EXCLUDED.events,
                    links = EXCLUDED.links
                "#,
            )
            .bind(&span.trace_id)
            .bind(&span.span_id)
            .bind(&span.parent_span_id)
            .bind(&span.name)
            .bind(span.kind.as_str())
            .bind(&span.service)
            .bind(span.start_time)
            .bind(span.end_time)
            .bind(span.duration_ms)
            .bind(span.status.as_str())
            .bind(serde_json::to_value(&span.attributes)?)
            .bind(serde_json::to_value(&span.events)?)
            .bind(serde_json::to_value(&span.links)?)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("insert span", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_err("commit span batch", e))?;
        Ok(())
    }

    async fn find_by_trace(&self, trace_id: &str) -> Result<Vec<Span>> {
        let rows = sqlx::query("SELECT * FROM spans WHERE trace_id = $1 ORDER BY start_time")
            .bind(trace_id)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("find spans by trace", e))?;
        rows.iter().map(span_from_row).collect()
    }

    async fn upsert_trace_summary(&self, summary: &TraceSummary) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO trace_summaries (
                trace_id, root_span_id, span_count, error_count,
                start_time, end_time, duration_ms, services
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (trace_id) DO UPDATE SET
                root_span_id = EXCLUDED.root_span_id,
                span_count = EXCLUDED.span_count,
                error_count = EXCLUDED.error_count,
                start_time = EXCLUDED.start_time,
                end_time = EXCLUDED.end_time,
                duration_ms = EXCLUDED.duration_ms,
                services = EXCLUDED.services
            "#,
        )
        .bind(&summary.trace_id)
        .bind(&summary.root_span_id)
        .bind(summary.span_count as i32)
        .bind(summary.error_count as i32)
        .bind(summary.start_time)
        .bind(summary.end_time)
        .bind(summary.duration_ms)
        .bind(serde_json::to_value(&summary.services)?)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("upsert trace summary", e))?;
        Ok(())
    }

    async fn find_recent_summaries(&self, limit: i64) -> Result<Vec<TraceSummary>> {
        let rows =
            sqlx::query("SELECT * FROM trace_summaries ORDER BY start_time DESC LIMIT $1")
                .bind(limit)
                .fetch_all(&self.pool)
                .await
                .map_err(|e| db_err("find recent traces", e))?;
        rows.iter().map(summary_from_row).collect()
    }

    async fn service_edges(&self, since: DateTime<Utc>) -> Result<Vec<ServiceEdge>> {
        let rows = sqlx::query(
            r#"
            SELECT parent.service AS parent_service,
                   child.service AS child_service,
                   COUNT(*) AS call_count
            FROM spans child
            JOIN spans parent
              ON parent.trace_id = child.trace_id
             AND parent.span_id = child.parent_span_id
            WHERE child.start_time >= $1
              AND child.service <> parent.service
            GROUP BY parent.service, child.service
            ORDER BY parent.service, child.service
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("service edges", e))?;

        rows.iter()
            .map(|row| {
                Ok(ServiceEdge {
                    parent_service: row
                        .try_get("parent_service")
                        .map_err(|e| row_err("spans", e))?,
                    child_service: row
                        .try_get("child_service")
                        .map_err(|e| row_err("spans", e))?,
                    call_count: row.try_get("call_count").map_err(|e| row_err("spans", e))?,
                })
            })
            .collect()
    }
}

/// Metric sample storage on Postgres
#[derive(Clone)]
pub struct PostgresMetricRepository {
    pool: PgPool,
}

impl PostgresMetricRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MetricRepository for PostgresMetricRepository {
    async fn upsert(&self, sample: &MetricSample) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO metric_samples (service, metric_type, value, window_start, window_end)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (service, metric_type, window_start) DO UPDATE SET
                value = EXCLUDED.value,
                window_end = EXCLUDED.window_end
            "#,
        )
        .bind(&sample.service)
        .bind(sample.metric_type.as_str())
        .bind(sample.value)
        .bind(sample.window_start)
        .bind(sample.window_end)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("upsert metric sample", e))?;
        Ok(())
    }

    async fn find_samples(
        &self,
        service: &str,
        metric_type: Option<MetricType>,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>> {
        let rows = sqlx::query(
            r#"
            SELECT service, metric_type, value, window_start, window_end
            FROM metric_samples
            WHERE service = $1
              AND ($2::text IS NULL OR metric_type = $2)
              AND window_start >= $3
              AND window_start < $4
            ORDER BY window_start
            "#,
        )
        .bind(service)
        .bind(metric_type.map(|m| m.as_str()))
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("find metric samples", e))?;

        rows.iter()
            .map(|row| {
                let metric_type: String = row
                    .try_get("metric_type")
                    .map_err(|e| row_err("metric_samples", e))?;
                Ok(MetricSample {
                    service: row
                        .try_get("service")
                        .map_err(|e| row_err("metric_samples", e))?,
                    metric_type: parse_metric_type(&metric_type)?,
                    value: row
                        .try_get("value")
                        .map_err(|e| row_err("metric_samples", e))?,
                    window_start: row
                        .try_get("window_start")
                        .map_err(|e| row_err("metric_samples", e))?,
                    window_end: row
                        .try_get("window_end")
                        .map_err(|e| row_err("metric_samples", e))?,
                })
            })
            .collect()
    }
}

const SEVERITY_RANK_SQL: &str =
    "CASE {} WHEN 'LOW' THEN 0 WHEN 'MEDIUM' THEN 1 WHEN 'HIGH' THEN 2 ELSE 3 END";

fn severity_rank(column: &str) -> String {
    SEVERITY_RANK_SQL.replace("{}", column)
}

/// Alert storage on Postgres. The partial unique index
/// (service, alert_type, time_bucket) WHERE NOT resolved arbitrates
/// concurrent dedupe inserts across replicas.
#[derive(Clone)]
pub struct PostgresAlertRepository {
    pool: PgPool,
}

impl PostgresAlertRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AlertRepository for PostgresAlertRepository {
    async fn insert_deduped(&self, alert: &NewAlert, time_bucket: i64) -> Result<DedupeResult> {
        // xmax = 0 distinguishes a fresh insert from a conflict-update.
        // The update arm only fires for a strict severity increase, so a
        // conflicting equal-or-lower alert returns no row at all.
        let sql = format!(
            r#"
            INSERT INTO alerts (
                project_id, alert_type, severity, message, service,
                resolved, created_at, sent, time_bucket
            )
            VALUES ($1, $2, $3, $4, $5, FALSE, $6, FALSE, $7)
            ON CONFLICT (service, alert_type, time_bucket) WHERE NOT resolved
            DO UPDATE SET severity = EXCLUDED.severity, message = EXCLUDED.message
                WHERE {existing} < {incoming}
            RETURNING *, (xmax = 0) AS inserted
            "#,
            existing = severity_rank("alerts.severity"),
            incoming = severity_rank("EXCLUDED.severity"),
        );

        let row = sqlx::query(&sql)
            .bind(alert.project_id)
            .bind(alert.alert_type.as_str())
            .bind(alert.severity.as_str())
            .bind(&alert.message)
            .bind(&alert.service)
            .bind(alert.created_at)
            .bind(time_bucket)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("dedupe alert insert", e))?;

        match row {
            Some(row) => {
                let inserted: bool = row.try_get("inserted").map_err(|e| row_err("alerts", e))?;
                let stored = alert_from_row(&row)?;
                Ok(DedupeResult {
                    outcome: if inserted {
                        DedupeOutcome::Created
                    } else {
                        DedupeOutcome::Updated
                    },
                    alert: stored,
                })
            }
            None => {
                let existing = self
                    .find_unresolved_in_bucket(&alert.service, alert.alert_type, time_bucket)
                    .await?
                    .ok_or_else(|| {
                        Error::Conflict(format!(
                            "dedupe row for {}/{}/{} vanished mid-upsert",
                            alert.service,
                            alert.alert_type.as_str(),
                            time_bucket
                        ))
                    })?;
                Ok(DedupeResult {
                    outcome: DedupeOutcome::Skipped,
                    alert: existing,
                })
            }
        }
    }

    async fn find_unresolved_in_bucket(
        &self,
        service: &str,
        alert_type: AlertType,
        time_bucket: i64,
    ) -> Result<Option<Alert>> {
        let row = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE service = $1 AND alert_type = $2 AND time_bucket = $3 AND NOT resolved
            "#,
        )
        .bind(service)
        .bind(alert_type.as_str())
        .bind(time_bucket)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("find unresolved alert", e))?;
        row.as_ref().map(alert_from_row).transpose()
    }

    async fn find_unsent_since(
        &self,
        service: &str,
        alert_type: AlertType,
        project_id: Option<ProjectId>,
        since: DateTime<Utc>,
    ) -> Result<Vec<Alert>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM alerts
            WHERE service = $1
              AND alert_type = $2
              AND project_id IS NOT DISTINCT FROM $3
              AND NOT sent
              AND NOT resolved
              AND created_at >= $4
            ORDER BY created_at
            "#,
        )
        .bind(service)
        .bind(alert_type.as_str())
        .bind(project_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("find unsent alerts", e))?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn mark_sent(&self, ids: &[AlertId], at: DateTime<Utc>) -> Result<()> {
        sqlx::query("UPDATE alerts SET sent = TRUE, last_sent_at = $2 WHERE id = ANY($1)")
            .bind(ids)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("mark alerts sent", e))?;
        Ok(())
    }

    async fn find_recent(&self, limit: i64) -> Result<Vec<Alert>> {
        let rows = sqlx::query("SELECT * FROM alerts ORDER BY created_at DESC LIMIT $1")
            .bind(limit)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| db_err("find recent alerts", e))?;
        rows.iter().map(alert_from_row).collect()
    }

    async fn resolve(&self, id: AlertId, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE alerts SET resolved = TRUE, resolved_at = $2 WHERE id = $1 AND NOT resolved",
        )
        .bind(id)
        .bind(at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("resolve alert", e))?;
        Ok(result.rows_affected() > 0)
    }
}

/// Alert channel reads on Postgres
#[derive(Clone)]
pub struct PostgresChannelRepository {
    pool: PgPool,
}

impl PostgresChannelRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ChannelRepository for PostgresChannelRepository {
    async fn find_active_for_project(&self, project_id: ProjectId) -> Result<Vec<AlertChannel>> {
        let rows = sqlx::query(
            "SELECT * FROM alert_channels WHERE project_id = $1 AND active",
        )
        .bind(project_id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("find alert channels", e))?;

        rows.iter()
            .map(|row| {
                let config: serde_json::Value = row
                    .try_get("config")
                    .map_err(|e| row_err("alert_channels", e))?;
                Ok(AlertChannel {
                    id: row.try_get("id").map_err(|e| row_err("alert_channels", e))?,
                    project_id: row
                        .try_get("project_id")
                        .map_err(|e| row_err("alert_channels", e))?,
                    name: row
                        .try_get("name")
                        .map_err(|e| row_err("alert_channels", e))?,
                    service_filter: row
                        .try_get("service_filter")
                        .map_err(|e| row_err("alert_channels", e))?,
                    active: row
                        .try_get("active")
                        .map_err(|e| row_err("alert_channels", e))?,
                    config: serde_json::from_value::<ChannelConfig>(config)?,
                })
            })
            .collect()
    }
}

/// Project lookups on Postgres
#[derive(Clone)]
pub struct PostgresProjectRepository {
    pool: PgPool,
}

impl PostgresProjectRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ProjectRepository for PostgresProjectRepository {
    async fn find_by_id(&self, id: ProjectId) -> Result<Option<Project>> {
        let row = sqlx::query("SELECT id, name, owner_email FROM projects WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("find project", e))?;
        row.map(|row| {
            Ok(Project {
                id: row.try_get("id").map_err(|e| row_err("projects", e))?,
                name: row.try_get("name").map_err(|e| row_err("projects", e))?,
                owner_email: row
                    .try_get("owner_email")
                    .map_err(|e| row_err("projects", e))?,
            })
        })
        .transpose()
    }

    async fn resolve_service_project(&self, service: &str) -> Result<Option<ProjectId>> {
        let id: Option<Uuid> =
            sqlx::query_scalar("SELECT project_id FROM service_projects WHERE service = $1")
                .bind(service)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| db_err("resolve service project", e))?;
        Ok(id)
    }

    async fn touch_service_binding(&self, service: &str, project_id: ProjectId) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO service_projects (service, project_id, updated_at)
            VALUES ($1, $2, now())
            ON CONFLICT (service) DO UPDATE SET
                project_id = EXCLUDED.project_id,
                updated_at = now()
            "#,
        )
        .bind(service)
        .bind(project_id)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("touch service binding", e))?;
        Ok(())
    }
}
