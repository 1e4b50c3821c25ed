//! Per-service error-rate model.
//!
//! Observations fall into fixed buckets aligned to the epoch. Closing a
//! bucket pushes its error ratio into two rings: a long baseline ring that
//! feeds the z-score signal and a short recent ring that feeds the
//! rate-of-change signal. Both signals are gated on volume, latched per
//! bucket and cooled down per reason so one incident produces one signal
//! per reason.

use argus_common::config::DetectorConfig;
use argus_common::stats::{RollingStats, RollingSum};
use argus_common::AlertSeverity;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Why a signal fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalReason {
    ZScore,
    RateChange,
}

impl SignalReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalReason::ZScore => "z-score",
            SignalReason::RateChange => "rate-change",
        }
    }
}

/// An anomaly signal produced by the model
#[derive(Debug, Clone)]
pub struct Signal {
    pub reason: SignalReason,
    pub severity: AlertSeverity,
    pub message: String,
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    start_secs: i64,
    error_count: u64,
    total_count: u64,
}

impl Bucket {
    fn new(start_secs: i64) -> Self {
        Self {
            start_secs,
            error_count: 0,
            total_count: 0,
        }
    }

    fn rate(&self) -> f64 {
        if self.total_count == 0 {
            0.0
        } else {
            self.error_count as f64 / self.total_count as f64
        }
    }
}

#[derive(Debug, Default)]
struct ReasonState {
    last_fire: Option<DateTime<Utc>>,
    latched: bool,
}

/// Bucketed error-ratio model for one service
pub struct ErrorRateModel {
    config: DetectorConfig,
    bucket: Option<Bucket>,
    baseline: RollingStats,
    recent: RollingSum,
    z_score: ReasonState,
    rate_change: ReasonState,
}

impl ErrorRateModel {
    pub fn new(config: DetectorConfig) -> Self {
        let baseline = RollingStats::new(config.baseline_buckets);
        let recent = RollingSum::new(config.recent_buckets);
        Self {
            config,
            bucket: None,
            baseline,
            recent,
            z_score: ReasonState::default(),
            rate_change: ReasonState::default(),
        }
    }

    fn bucket_start(&self, ts: DateTime<Utc>) -> i64 {
        ts.timestamp().div_euclid(self.config.bucket_secs) * self.config.bucket_secs
    }

    /// Feed one observation. Returns the signals fired by any bucket this
    /// observation closed, followed by signals from the now-open bucket.
    pub fn observe(&mut self, timestamp: DateTime<Utc>, is_error: bool) -> Vec<Signal> {
        let start = self.bucket_start(timestamp);
        let mut signals = Vec::new();

        if let Some(current) = self.bucket {
            if start > current.start_secs {
                let gap_buckets = (start - current.start_secs) / self.config.bucket_secs;
                let ring_span = (self.config.baseline_buckets + self.config.recent_buckets) as i64;
                if gap_buckets > ring_span {
                    debug!(
                        gap_buckets,
                        "observation gap exceeds ring span, resetting model state"
                    );
                    self.reset();
                } else {
                    signals.extend(self.close_bucket(current, timestamp));
                    // Empty buckets between the closed one and the new one
                    // contribute zero ratios to both rings.
                    for _ in 1..gap_buckets {
                        self.baseline.push(0.0);
                        self.recent.push(0.0);
                    }
                }
                self.bucket = Some(Bucket::new(start));
                self.z_score.latched = false;
                self.rate_change.latched = false;
            }
            // A late in-bucket observation counts into the open bucket.
        }

        let bucket = self.bucket.get_or_insert_with(|| Bucket::new(start));
        bucket.total_count += 1;
        if is_error {
            bucket.error_count += 1;
        }

        let open = *bucket;
        signals.extend(self.evaluate(&open, false, timestamp));
        signals
    }

    fn close_bucket(&mut self, bucket: Bucket, at: DateTime<Utc>) -> Vec<Signal> {
        let signals = self.evaluate(&bucket, true, at);
        self.baseline.push(bucket.rate());
        self.recent.push(bucket.rate());
        signals
    }

    fn reset(&mut self) {
        self.baseline.clear();
        self.recent.clear();
        self.bucket = None;
        self.z_score = ReasonState::default();
        self.rate_change = ReasonState::default();
    }

    fn cooldown_ok(&self, state: &ReasonState, at: DateTime<Utc>) -> bool {
        match state.last_fire {
            Some(last) => at - last >= Duration::milliseconds(self.config.cooldown_ms),
            None => true,
        }
    }

    fn evaluate(&mut self, bucket: &Bucket, closed: bool, at: DateTime<Utc>) -> Vec<Signal> {
        let rate = bucket.rate();

        let volume_ok = bucket.total_count >= self.config.min_total
            || (closed && bucket.error_count >= self.config.min_error_count);
        if !volume_ok || rate < self.config.min_error_rate {
            return Vec::new();
        }

        let mut signals = Vec::new();

        if let Some(signal) = self.evaluate_z_score(rate, at) {
            self.z_score.latched = true;
            self.z_score.last_fire = Some(at);
            signals.push(signal);
        }
        if let Some(signal) = self.evaluate_rate_change(rate, at) {
            self.rate_change.latched = true;
            self.rate_change.last_fire = Some(at);
            signals.push(signal);
        }
        signals
    }

    fn evaluate_z_score(&self, rate: f64, at: DateTime<Utc>) -> Option<Signal> {
        if self.z_score.latched || !self.cooldown_ok(&self.z_score, at) {
            return None;
        }
        if self.baseline.len() < self.config.min_baseline_fill {
            return None;
        }

        let mean = self.baseline.mean();
        let sigma = self.baseline.stddev();
        let delta = rate - mean;
        if delta <= 0.0 {
            return None;
        }

        // A flat baseline would make any uptick infinitely significant, so
        // the deviation is floored at sigma_min and the lift must clear
        // delta_min in absolute terms.
        let z = delta / sigma.max(self.config.sigma_min);
        if z < self.config.z_threshold {
            return None;
        }
        if sigma < self.config.sigma_min && delta < self.config.delta_min {
            return None;
        }

        let severity = if sigma >= self.config.sigma_min {
            if z >= 6.0 {
                AlertSeverity::Critical
            } else if z >= 4.0 {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            }
        } else if delta >= 0.15 {
            AlertSeverity::Critical
        } else if delta >= 0.07 {
            AlertSeverity::High
        } else {
            AlertSeverity::Medium
        };

        Some(Signal {
            reason: SignalReason::ZScore,
            severity,
            message: format!(
                "error rate {:.1}% has z-score {:.1} against baseline mean {:.1}%",
                rate * 100.0,
                z,
                mean * 100.0
            ),
        })
    }

    fn evaluate_rate_change(&self, rate: f64, at: DateTime<Utc>) -> Option<Signal> {
        if self.rate_change.latched || !self.cooldown_ok(&self.rate_change, at) {
            return None;
        }
        if !self.recent.is_full() {
            return None;
        }

        let avg = self.recent.mean();
        if avg > 0.0 {
            let ratio = rate / avg - 1.0;
            if ratio < self.config.rate_change_threshold {
                return None;
            }
            let severity = if ratio >= 2.0 {
                AlertSeverity::Critical
            } else if ratio >= 1.0 {
                AlertSeverity::High
            } else {
                AlertSeverity::Medium
            };
            Some(Signal {
                reason: SignalReason::RateChange,
                severity,
                message: format!(
                    "error rate {:.1}% is {:.0}% above the recent average {:.1}%",
                    rate * 100.0,
                    ratio * 100.0,
                    avg * 100.0
                ),
            })
        } else if rate >= self.config.min_error_rate {
            Some(Signal {
                reason: SignalReason::RateChange,
                severity: AlertSeverity::Critical,
                message: format!(
                    "error rate jumped to {:.1}% from a zero recent average",
                    rate * 100.0
                ),
            })
        } else {
            None
        }
    }
}
