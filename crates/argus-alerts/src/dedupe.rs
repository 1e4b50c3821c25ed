//! Alert deduplication.
//!
//! Near-simultaneous alerts for the same (service, type) collapse into one
//! row per coarse time bucket. Storage arbitrates through the unresolved
//! unique index, so concurrent producers and other replicas need no
//! in-process coordination; this wrapper adds the bounded retry and the
//! skew-tolerant fallback lookup.

use argus_common::config::DedupeConfig;
use argus_common::retry::{retry, RetryConfig};
use argus_common::{Error, NewAlert, Result};
use argus_storage::{AlertRepository, DedupeOutcome, DedupeResult};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Deduplicating front door for every alert entering storage
pub struct AlertDeduper {
    repo: Arc<dyn AlertRepository>,
    config: DedupeConfig,
    retry: RetryConfig,
}

impl AlertDeduper {
    pub fn new(repo: Arc<dyn AlertRepository>, config: DedupeConfig) -> Self {
        let retry = RetryConfig::new(
            config.max_retries.max(1),
            Duration::from_millis(config.retry_base_ms),
        );
        Self {
            repo,
            config,
            retry,
        }
    }

    /// The dedupe bucket an instant falls into
    pub fn time_bucket(&self, at: DateTime<Utc>) -> i64 {
        at.timestamp().div_euclid(self.config.bucket_secs)
    }

    /// Insert an alert through the dedupe key, merging severity upward on
    /// collision.
    ///
    /// Unique-constraint races are retried with backoff; if they persist,
    /// the existing row is looked up in the computed bucket and then in up
    /// to `skew_buckets` earlier ones, tolerating producers whose clocks
    /// straddle a bucket boundary.
    pub async fn insert_deduped(&self, alert: &NewAlert) -> Result<DedupeResult> {
        let bucket = self.time_bucket(alert.created_at);

        let attempt = retry("alert dedupe upsert", &self.retry, || {
            self.repo.insert_deduped(alert, bucket)
        })
        .await;

        match attempt {
            Ok(result) => {
                debug!(
                    service = %alert.service,
                    alert_type = alert.alert_type.as_str(),
                    bucket,
                    outcome = ?result.outcome,
                    "alert deduped"
                );
                Ok(result)
            }
            Err(Error::Conflict(reason)) => {
                warn!(
                    service = %alert.service,
                    bucket,
                    reason = %reason,
                    "dedupe upsert kept conflicting, falling back to bucket lookup"
                );
                for offset in 0..=self.config.skew_buckets.max(0) {
                    if let Some(existing) = self
                        .repo
                        .find_unresolved_in_bucket(
                            &alert.service,
                            alert.alert_type,
                            bucket - offset,
                        )
                        .await?
                    {
                        return Ok(DedupeResult {
                            outcome: DedupeOutcome::Skipped,
                            alert: existing,
                        });
                    }
                }
                Err(Error::Conflict(reason))
            }
            Err(e) => Err(e),
        }
    }
}
