//! Anomaly detection across services.
//!
//! Owns one `ErrorRateModel` per service plus the last-seen table feeding
//! the liveness watchdog. State is partitioned the same way the aggregator
//! partitions windows: coarse read over the service index, then a
//! per-service lock.

use crate::model::{ErrorRateModel, Signal};
use argus_common::config::DetectorConfig;
use argus_common::{AlertSeverity, AlertType, LogRecord, MetricSample, MetricType, NewAlert};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Hybrid anomaly detector: statistical error-rate signals, a p95 latency
/// threshold rule and a service-liveness watchdog.
pub struct AnomalyDetector {
    config: DetectorConfig,
    models: RwLock<HashMap<String, Arc<Mutex<ErrorRateModel>>>>,
    last_seen: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl AnomalyDetector {
    pub fn new(config: DetectorConfig) -> Self {
        Self {
            config,
            models: RwLock::new(HashMap::new()),
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    async fn model_for(&self, service: &str) -> Arc<Mutex<ErrorRateModel>> {
        if let Some(model) = self.models.read().await.get(service) {
            return model.clone();
        }
        let mut models = self.models.write().await;
        models
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ErrorRateModel::new(self.config.clone()))))
            .clone()
    }

    /// Feed one log: refresh liveness, update the service's error-rate
    /// model, convert fired signals into ERROR_SPIKE alerts stamped `now`.
    pub async fn observe_log(&self, log: &LogRecord, now: DateTime<Utc>) -> Vec<NewAlert> {
        {
            let mut last_seen = self.last_seen.lock().await;
            last_seen.insert(log.service.clone(), log.timestamp);
        }

        let model = self.model_for(&log.service).await;
        let signals = {
            let mut model = model.lock().await;
            model.observe(log.timestamp, log.level.is_error())
        };

        signals
            .into_iter()
            .map(|signal| self.spike_alert(&log.service, signal, now))
            .collect()
    }

    fn spike_alert(&self, service: &str, signal: Signal, now: DateTime<Utc>) -> NewAlert {
        debug!(
            service,
            reason = signal.reason.as_str(),
            severity = signal.severity.as_str(),
            "error-rate signal fired"
        );
        NewAlert {
            alert_type: AlertType::ErrorSpike,
            severity: signal.severity,
            message: format!("{}: {}", service, signal.message),
            service: service.to_string(),
            created_at: now,
            project_id: None,
        }
    }

    /// Apply the latency threshold rule to finalized metric samples
    pub fn evaluate_metrics(&self, samples: &[MetricSample], now: DateTime<Utc>) -> Vec<NewAlert> {
        let threshold = self.config.latency_threshold_ms;
        samples
            .iter()
            .filter(|sample| sample.metric_type == MetricType::LatencyP95)
            .filter(|sample| sample.value > threshold)
            .map(|sample| {
                let severity = if sample.value > 3.0 * threshold {
                    AlertSeverity::Critical
                } else if sample.value > 2.0 * threshold {
                    AlertSeverity::High
                } else {
                    AlertSeverity::Medium
                };
                NewAlert {
                    alert_type: AlertType::HighLatency,
                    severity,
                    message: format!(
                        "{}: p95 latency {:.0}ms exceeds the {:.0}ms threshold",
                        sample.service, sample.value, threshold
                    ),
                    service: sample.service.clone(),
                    created_at: now,
                    project_id: None,
                }
            })
            .collect()
    }

    /// Report services that have gone silent. A reported service leaves the
    /// table until it logs again, so one outage yields one alert.
    pub async fn check_liveness(&self, now: DateTime<Utc>) -> Vec<NewAlert> {
        let cutoff = chrono::Duration::minutes(self.config.downtime_minutes);
        let mut last_seen = self.last_seen.lock().await;

        let down: Vec<(String, DateTime<Utc>)> = last_seen
            .iter()
            .filter(|(_, seen)| now - **seen > cutoff)
            .map(|(service, seen)| (service.clone(), *seen))
            .collect();

        down.into_iter()
            .map(|(service, seen)| {
                last_seen.remove(&service);
                let silent_minutes = (now - seen).num_minutes();
                info!(service = %service, silent_minutes, "service considered down");
                NewAlert {
                    alert_type: AlertType::ServiceDown,
                    severity: AlertSeverity::High,
                    message: format!(
                        "{}: no logs received for {} minutes",
                        service, silent_minutes
                    ),
                    service,
                    created_at: now,
                    project_id: None,
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_common::{Config, LogLevel};
    use chrono::{Duration, TimeZone};
    use std::collections::HashMap as StdHashMap;

    fn detector() -> AnomalyDetector {
        AnomalyDetector::new(Config::default().detector)
    }

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_400, 0).single().unwrap()
    }

    fn log(service: &str, ts: DateTime<Utc>, level: LogLevel) -> LogRecord {
        LogRecord {
            id: 0,
            timestamp: ts,
            level,
            service: service.to_string(),
            message: "m".to_string(),
            metadata: StdHashMap::new(),
            trace_id: None,
            span_id: None,
        }
    }

    fn sample(service: &str, metric_type: MetricType, value: f64) -> MetricSample {
        MetricSample {
            service: service.to_string(),
            metric_type,
            value,
            window_start: t0(),
            window_end: t0() + Duration::seconds(60),
        }
    }

    #[tokio::test]
    async fn latency_rule_grades_severity() {
        let detector = detector();
        let now = t0();

        let alerts = detector.evaluate_metrics(&[sample("api", MetricType::LatencyP95, 1100.0)], now);
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::HighLatency);
        assert_eq!(alerts[0].severity, AlertSeverity::Medium);

        let alerts = detector.evaluate_metrics(&[sample("api", MetricType::LatencyP95, 2500.0)], now);
        assert_eq!(alerts[0].severity, AlertSeverity::High);

        let alerts = detector.evaluate_metrics(&[sample("api", MetricType::LatencyP95, 3100.0)], now);
        assert_eq!(alerts[0].severity, AlertSeverity::Critical);

        // At or under the threshold: nothing.
        assert!(detector
            .evaluate_metrics(&[sample("api", MetricType::LatencyP95, 1000.0)], now)
            .is_empty());
        // Other metric types are ignored even with huge values.
        assert!(detector
            .evaluate_metrics(&[sample("api", MetricType::Throughput, 99_999.0)], now)
            .is_empty());
    }

    #[tokio::test]
    async fn watchdog_reports_silent_services_once() {
        let detector = detector();
        let seen_at = t0();
        detector
            .observe_log(&log("svc-x", seen_at, LogLevel::Info), seen_at)
            .await;
        detector
            .observe_log(&log("svc-y", seen_at + Duration::minutes(4), LogLevel::Info), seen_at)
            .await;

        let now = seen_at + Duration::minutes(6);
        let alerts = detector.check_liveness(now).await;
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].alert_type, AlertType::ServiceDown);
        assert_eq!(alerts[0].severity, AlertSeverity::High);
        assert_eq!(alerts[0].service, "svc-x");

        // Second sweep stays quiet until svc-x logs again.
        assert!(detector.check_liveness(now + Duration::minutes(1)).await.is_empty());

        let back = now + Duration::minutes(2);
        detector
            .observe_log(&log("svc-x", back, LogLevel::Info), back)
            .await;
        let alerts = detector
            .check_liveness(back + Duration::minutes(6))
            .await;
        // Both services are silent again by now.
        assert_eq!(alerts.len(), 2);
    }

    #[tokio::test]
    async fn error_spikes_become_alerts() {
        let detector = detector();
        let base = t0();

        // Ten quiet buckets then a hot one, closed by a later log.
        for bucket in 0..10i64 {
            for i in 0..10i64 {
                let level = if i == 0 { LogLevel::Error } else { LogLevel::Info };
                let ts = base + Duration::seconds(bucket * 60 + i);
                detector.observe_log(&log("pay", ts, level), ts).await;
            }
        }
        let mut alerts = Vec::new();
        for i in 0..10i64 {
            let level = if i < 8 { LogLevel::Error } else { LogLevel::Info };
            let ts = base + Duration::seconds(600 + i);
            alerts.extend(detector.observe_log(&log("pay", ts, level), ts).await);
        }
        let close = base + Duration::seconds(660);
        alerts.extend(detector.observe_log(&log("pay", close, LogLevel::Info), close).await);

        assert!(!alerts.is_empty());
        assert!(alerts.iter().all(|a| a.alert_type == AlertType::ErrorSpike));
        assert!(alerts.iter().all(|a| a.service == "pay"));
        assert!(alerts.iter().any(|a| a.severity >= AlertSeverity::High));
    }
}
