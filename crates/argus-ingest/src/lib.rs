//! Argus Ingest - the write-through path from instrumented services into
//! storage.
//!
//! The HTTP surface hands batches to [`IngestionBridge`]; valid records
//! are persisted atomically and the report carries index-addressed
//! rejections back to the client. Persistence precedes all processing, so
//! downstream slowness never throttles ingestion.

pub mod validate;

use argus_common::config::IngestConfig;
use argus_common::{
    Error, IngestError, IngestReport, LogRecord, NewLogRecord, Result, Span, SpanIngestReport,
    TraceSummary,
};
use argus_storage::{LogRepository, SpanRepository};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// A successful log ingest: the client-facing report plus the persisted
/// records for in-process processing.
#[derive(Debug)]
pub struct IngestOutcome {
    pub report: IngestReport,
    pub records: Vec<LogRecord>,
}

/// Validating, batching front door to log and span storage
pub struct IngestionBridge {
    logs: Arc<dyn LogRepository>,
    spans: Arc<dyn SpanRepository>,
    config: IngestConfig,
}

impl IngestionBridge {
    pub fn new(
        logs: Arc<dyn LogRepository>,
        spans: Arc<dyn SpanRepository>,
        config: IngestConfig,
    ) -> Self {
        Self {
            logs,
            spans,
            config,
        }
    }

    /// Validate and persist a batch of log records.
    ///
    /// `default_service` (derived from the caller's API key binding) fills
    /// in any record submitted without a service. The batch is all-or-
    /// nothing at the storage layer; validation failures only reject the
    /// offending records.
    pub async fn ingest_logs(
        &self,
        batch: Vec<NewLogRecord>,
        default_service: Option<&str>,
    ) -> Result<IngestOutcome> {
        if batch.len() > self.config.max_batch_size {
            return Err(Error::Validation(format!(
                "batch of {} exceeds the {}-record limit",
                batch.len(),
                self.config.max_batch_size
            )));
        }

        let mut valid = Vec::with_capacity(batch.len());
        let mut errors = Vec::new();
        for (index, mut record) in batch.into_iter().enumerate() {
            if record.service.trim().is_empty() {
                if let Some(service) = default_service {
                    record.service = service.to_string();
                }
            }
            match validate::validate_log(&record) {
                None => valid.push(record),
                Some(reason) => {
                    debug!(index, reason = %reason, "rejecting log record");
                    errors.push(IngestError { index, reason });
                }
            }
        }

        let mut records = Vec::with_capacity(valid.len());
        if !valid.is_empty() {
            let ids = self.logs.insert_batch(&valid).await?;
            records.extend(valid.into_iter().zip(ids).map(|(record, id)| LogRecord {
                id,
                timestamp: record.timestamp,
                level: record.level,
                service: record.service,
                message: record.message,
                metadata: record.metadata,
                trace_id: record.trace_id,
                span_id: record.span_id,
            }));
        }

        let report = IngestReport {
            accepted: records.len(),
            rejected: errors.len(),
            errors,
        };
        Ok(IngestOutcome { report, records })
    }

    /// Validate and persist a batch of spans, then recompute the aggregate
    /// for every touched trace.
    pub async fn ingest_spans(
        &self,
        batch: Vec<Span>,
        default_service: Option<&str>,
    ) -> Result<SpanIngestReport> {
        if batch.len() > self.config.max_batch_size {
            return Err(Error::Validation(format!(
                "batch of {} exceeds the {}-record limit",
                batch.len(),
                self.config.max_batch_size
            )));
        }

        let mut valid = Vec::with_capacity(batch.len());
        let mut errors = Vec::new();
        for (index, mut span) in batch.into_iter().enumerate() {
            if span.service.trim().is_empty() {
                if let Some(service) = default_service {
                    span.service = service.to_string();
                }
            }
            match validate::validate_span(&span) {
                None => valid.push(span),
                Some(reason) => {
                    debug!(index, reason = %reason, "rejecting span");
                    errors.push(IngestError { index, reason });
                }
            }
        }

        let touched: BTreeSet<String> = valid.iter().map(|s| s.trace_id.clone()).collect();
        if !valid.is_empty() {
            self.spans.insert_batch(&valid).await?;
        }

        for trace_id in touched {
            if let Err(e) = self.refresh_trace_summary(&trace_id).await {
                // The spans themselves are durable; the aggregate catches
                // up on the trace's next batch.
                warn!(trace_id = %trace_id, error = %e, "trace summary refresh failed");
            }
        }

        Ok(SpanIngestReport {
            accepted: valid.len(),
            rejected: errors.len(),
            errors,
        })
    }

    async fn refresh_trace_summary(&self, trace_id: &str) -> Result<()> {
        let spans = self.spans.find_by_trace(trace_id).await?;
        let Some(summary) = summarize_trace(trace_id, &spans) else {
            return Ok(());
        };
        self.spans.upsert_trace_summary(&summary).await
    }
}

/// Fold a trace's spans into its aggregate row
fn summarize_trace(trace_id: &str, spans: &[Span]) -> Option<TraceSummary> {
    if spans.is_empty() {
        return None;
    }

    let start_time = spans.iter().map(|s| s.start_time).min()?;
    let end_time = spans.iter().filter_map(|s| s.end_time).max();
    let error_count = spans
        .iter()
        .filter(|s| s.status == argus_common::SpanStatus::Error)
        .count() as u32;
    let root_span_id = spans
        .iter()
        .find(|s| s.parent_span_id.is_none())
        .map(|s| s.span_id.clone());

    let mut services: Vec<String> = spans.iter().map(|s| s.service.clone()).collect();
    services.sort();
    services.dedup();

    Some(TraceSummary {
        trace_id: trace_id.to_string(),
        root_span_id,
        span_count: spans.len() as u32,
        error_count,
        start_time,
        end_time,
        duration_ms: end_time.map(|end| (end - start_time).num_milliseconds() as f64),
        services,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_common::{Config, LogLevel, SpanKind, SpanStatus};
    use argus_storage::memory::{MemoryLogRepository, MemorySpanRepository};
    use chrono::{Duration, Utc};
    use std::collections::HashMap;

    fn bridge() -> (
        IngestionBridge,
        Arc<MemoryLogRepository>,
        Arc<MemorySpanRepository>,
    ) {
        let logs = Arc::new(MemoryLogRepository::new());
        let spans = Arc::new(MemorySpanRepository::new());
        let bridge =
            IngestionBridge::new(logs.clone(), spans.clone(), Config::default().ingest);
        (bridge, logs, spans)
    }

    fn log(service: &str, message: &str) -> NewLogRecord {
        NewLogRecord {
            timestamp: Utc::now(),
            level: LogLevel::Info,
            service: service.to_string(),
            message: message.to_string(),
            metadata: HashMap::new(),
            trace_id: None,
            span_id: None,
        }
    }

    fn span(trace: &str, id: &str, parent: Option<&str>, status: SpanStatus) -> Span {
        let start = Utc::now();
        Span {
            trace_id: trace.to_string(),
            span_id: id.to_string(),
            parent_span_id: parent.map(|p| p.to_string()),
            name: "op".to_string(),
            kind: SpanKind::Server,
            service: "svc".to_string(),
            start_time: start,
            end_time: Some(start + Duration::milliseconds(250)),
            duration_ms: Some(250.0),
            status,
            attributes: HashMap::new(),
            events: Vec::new(),
            links: Vec::new(),
        }
    }

    #[tokio::test]
    async fn mixed_batch_reports_rejected_indices() {
        let (bridge, logs, _) = bridge();
        let outcome = bridge
            .ingest_logs(
                vec![
                    log("svc", "ok"),
                    log("svc", ""),
                    log("svc", "also ok"),
                    log("", "no service and no default"),
                ],
                None,
            )
            .await
            .unwrap();

        assert_eq!(outcome.report.accepted, 2);
        assert_eq!(outcome.report.rejected, 2);
        let indices: Vec<usize> = outcome.report.errors.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 3]);

        // Only the valid records were persisted, with assigned ids.
        assert_eq!(outcome.records.len(), 2);
        assert!(outcome.records.iter().all(|r| r.id > 0));
        assert_eq!(logs.find_recent(10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn default_service_fills_blanks() {
        let (bridge, _, _) = bridge();
        let outcome = bridge
            .ingest_logs(vec![log("", "from key-bound client")], Some("checkout"))
            .await
            .unwrap();
        assert_eq!(outcome.report.accepted, 1);
        assert_eq!(outcome.records[0].service, "checkout");
    }

    #[tokio::test]
    async fn oversize_batch_fails_fast() {
        let (bridge, logs, _) = bridge();
        let batch: Vec<NewLogRecord> = (0..1001).map(|i| log("svc", &format!("m{}", i))).collect();
        let err = bridge.ingest_logs(batch, None).await.unwrap_err();
        assert_eq!(err.category(), "validation");
        assert!(logs.find_recent(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn span_ingest_maintains_trace_summary() {
        let (bridge, _, spans) = bridge();
        let trace = "a".repeat(32);

        let report = bridge
            .ingest_spans(
                vec![
                    span(&trace, &"1".repeat(16), None, SpanStatus::Ok),
                    span(&trace, &"2".repeat(16), Some(&"1".repeat(16)), SpanStatus::Error),
                ],
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.accepted, 2);

        let summary = spans.trace_summary(&trace).await.unwrap();
        assert_eq!(summary.span_count, 2);
        assert_eq!(summary.error_count, 1);
        assert_eq!(summary.root_span_id, Some("1".repeat(16)));
        assert_eq!(summary.services, vec!["svc".to_string()]);
        assert!(summary.duration_ms.is_some());

        // A later batch for the same trace refreshes the aggregate.
        bridge
            .ingest_spans(
                vec![span(&trace, &"3".repeat(16), Some(&"1".repeat(16)), SpanStatus::Ok)],
                None,
            )
            .await
            .unwrap();
        let summary = spans.trace_summary(&trace).await.unwrap();
        assert_eq!(summary.span_count, 3);

        let recent = spans.find_recent_summaries(10).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].trace_id, trace);
    }

    #[tokio::test]
    async fn invalid_spans_are_rejected_by_index() {
        let (bridge, _, _) = bridge();
        let mut bad = span(&"a".repeat(32), &"1".repeat(16), None, SpanStatus::Ok);
        bad.trace_id = "short".to_string();

        let report = bridge
            .ingest_spans(
                vec![span(&"b".repeat(32), &"2".repeat(16), None, SpanStatus::Ok), bad],
                None,
            )
            .await
            .unwrap();
        assert_eq!(report.accepted, 1);
        assert_eq!(report.rejected, 1);
        assert_eq!(report.errors[0].index, 1);
    }
}
