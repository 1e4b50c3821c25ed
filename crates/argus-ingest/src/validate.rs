//! Per-record validation for ingest batches.
//!
//! Invalid records never enter the pipeline; each failure is reported
//! against its index in the submitted batch so clients can fix and resend
//! just the rejects.

use argus_common::{NewLogRecord, Span};
use chrono::{Duration, Utc};

/// How far in the future a timestamp may sit before it is rejected as
/// unparseable clock garbage.
const MAX_FUTURE_SKEW_HOURS: i64 = 24;

/// Validate a log record. Returns the rejection reason, if any.
pub fn validate_log(record: &NewLogRecord) -> Option<String> {
    if record.message.trim().is_empty() {
        return Some("message must not be empty".to_string());
    }
    if record.service.trim().is_empty() {
        return Some("service must not be empty".to_string());
    }
    if record.timestamp > Utc::now() + Duration::hours(MAX_FUTURE_SKEW_HOURS) {
        return Some("timestamp is too far in the future".to_string());
    }
    if let Some(trace_id) = record.trace_id.as_deref() {
        if !is_hex_id(trace_id, 32) {
            return Some("trace_id must be 32 hex characters".to_string());
        }
    }
    if let Some(span_id) = record.span_id.as_deref() {
        if !is_hex_id(span_id, 16) {
            return Some("span_id must be 16 hex characters".to_string());
        }
    }
    None
}

/// Validate a span. Returns the rejection reason, if any.
pub fn validate_span(span: &Span) -> Option<String> {
    if !is_hex_id(&span.trace_id, 32) {
        return Some("trace_id must be 32 hex characters".to_string());
    }
    if !is_hex_id(&span.span_id, 16) {
        return Some("span_id must be 16 hex characters".to_string());
    }
    if let Some(parent) = span.parent_span_id.as_deref() {
        if !is_hex_id(parent, 16) {
            return Some("parent_span_id must be 16 hex characters".to_string());
        }
    }
    if span.name.trim().is_empty() {
        return Some("name must not be empty".to_string());
    }
    if span.service.trim().is_empty() {
        return Some("service must not be empty".to_string());
    }
    if let Some(end) = span.end_time {
        if end < span.start_time {
            return Some("end_time precedes start_time".to_string());
        }
    }
    if let Some(duration) = span.duration_ms {
        if !duration.is_finite() || duration < 0.0 {
            return Some("duration_ms must be a non-negative number".to_string());
        }
    }
    None
}

fn is_hex_id(raw: &str, len: usize) -> bool {
    raw.len() == len && raw.chars().all(|c| c.is_ascii_hexdigit())
}
