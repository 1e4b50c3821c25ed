//! Configuration for the Argus core

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    pub ingest: IngestConfig,
    pub windowing: WindowConfig,
    pub detector: DetectorConfig,
    pub dedupe: DedupeConfig,
    pub dispatcher: DispatcherConfig,
    pub bus: BusConfig,
    pub listener: ListenerConfig,
    pub sinks: SinkConfig,
    pub processor: ProcessorConfig,
}

/// Storage pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_ms: u64,
}

/// Ingestion limits. The HTTP surface enforces the body/rate limits; the
/// bridge enforces the batch cap.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IngestConfig {
    pub api_port: u16,
    pub max_batch_size: usize,
    pub max_body_bytes: u64,
    pub request_timeout_ms: u64,
    pub rate_limit_max: u32,
    pub rate_limit_window_ms: u64,
    pub cors_origins: Vec<String>,
}

/// Tumbling-window parameters for the metric aggregator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowConfig {
    pub window_secs: i64,
    pub grace_secs: i64,
    pub max_latencies_per_window: usize,
}

/// Anomaly detector thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectorConfig {
    /// Error-rate bucket size in seconds
    pub bucket_secs: i64,
    /// Baseline ring length in buckets
    pub baseline_buckets: usize,
    /// Rate-of-change ring length in buckets
    pub recent_buckets: usize,
    /// Minimum baseline fill before the z-score signal arms
    pub min_baseline_fill: usize,
    /// Floor applied to the baseline standard deviation
    pub sigma_min: f64,
    /// z-score firing threshold
    pub z_threshold: f64,
    /// Minimum absolute rate lift over the baseline mean
    pub delta_min: f64,
    /// Minimum observations in a bucket before any signal fires
    pub min_total: u64,
    /// Closed-bucket alternative volume gate
    pub min_error_count: u64,
    /// Minimum error rate worth alerting on
    pub min_error_rate: f64,
    /// Rate-of-change firing threshold (0.5 = +50%)
    pub rate_change_threshold: f64,
    /// Per-reason cooldown in milliseconds
    pub cooldown_ms: i64,
    /// p95 latency threshold in milliseconds
    pub latency_threshold_ms: f64,
    /// Silence duration before a service is considered down
    pub downtime_minutes: i64,
}

/// Alert dedupe bucketing and retry policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupeConfig {
    /// Dedupe bucket width in seconds
    pub bucket_secs: i64,
    /// How many earlier buckets the fallback lookup tolerates (clock skew)
    pub skew_buckets: i64,
    pub max_retries: u32,
    pub retry_base_ms: u64,
}

/// Dispatcher cooldowns and batching
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    pub cooldown_low_secs: i64,
    pub cooldown_medium_secs: i64,
    pub cooldown_high_secs: i64,
    pub cooldown_critical_secs: i64,
    pub batch_window_secs: i64,
    pub sink_timeout_ms: u64,
}

/// Event bus sizing
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    pub subscriber_capacity: usize,
}

/// Change-notification listener behavior
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    pub channel: String,
    pub catchup_limit: i64,
    pub processed_set_capacity: usize,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
}

/// Outbound sink credentials
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SinkConfig {
    pub webhook_url: Option<String>,
    pub email_api_url: Option<String>,
    pub email_api_key: Option<String>,
    pub email_from: Option<String>,
}

/// Orchestrator timers and shutdown bounds
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    pub watchdog_interval_secs: u64,
    pub drain_timeout_ms: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig {
                database_url: String::new(),
                max_connections: 10,
                acquire_timeout_ms: 5_000,
            },
            ingest: IngestConfig {
                api_port: 3000,
                max_batch_size: 1_000,
                max_body_bytes: 10 * 1024 * 1024,
                request_timeout_ms: 30_000,
                rate_limit_max: 100,
                rate_limit_window_ms: 900_000,
                cors_origins: Vec::new(),
            },
            windowing: WindowConfig {
                window_secs: 60,
                grace_secs: 1,
                max_latencies_per_window: 10_000,
            },
            detector: DetectorConfig {
                bucket_secs: 60,
                baseline_buckets: 60,
                recent_buckets: 5,
                min_baseline_fill: 5,
                sigma_min: 0.01,
                z_threshold: 3.0,
                delta_min: 0.02,
                min_total: 20,
                min_error_count: 5,
                min_error_rate: 0.02,
                rate_change_threshold: 0.5,
                cooldown_ms: 120_000,
                latency_threshold_ms: 1_000.0,
                downtime_minutes: 5,
            },
            dedupe: DedupeConfig {
                bucket_secs: 5,
                skew_buckets: 1,
                max_retries: 3,
                retry_base_ms: 50,
            },
            dispatcher: DispatcherConfig {
                cooldown_low_secs: 15 * 60,
                cooldown_medium_secs: 10 * 60,
                cooldown_high_secs: 5 * 60,
                cooldown_critical_secs: 60,
                batch_window_secs: 5 * 60,
                sink_timeout_ms: 10_000,
            },
            bus: BusConfig {
                subscriber_capacity: 1_024,
            },
            listener: ListenerConfig {
                channel: "log_inserted".to_string(),
                catchup_limit: 1_000,
                processed_set_capacity: 10_000,
                backoff_initial_ms: 100,
                backoff_max_ms: 5_000,
            },
            sinks: SinkConfig::default(),
            processor: ProcessorConfig {
                watchdog_interval_secs: 60,
                drain_timeout_ms: 10_000,
            },
        }
    }
}

impl Config {
    /// Build a configuration from the process environment.
    ///
    /// `DATABASE_URL` is required; everything else falls back to defaults.
    /// Unparseable values are configuration errors rather than silent
    /// fallbacks.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();

        config.storage.database_url = env::var("DATABASE_URL")
            .map_err(|_| Error::Config("DATABASE_URL is required".to_string()))?;

        config.ingest.api_port = env_parse("API_PORT", config.ingest.api_port)?;
        config.ingest.request_timeout_ms =
            env_parse("REQUEST_TIMEOUT_MS", config.ingest.request_timeout_ms)?;
        config.ingest.rate_limit_max =
            env_parse("RATE_LIMIT_MAX", config.ingest.rate_limit_max)?;
        config.ingest.rate_limit_window_ms =
            env_parse("RATE_LIMIT_WINDOW_MS", config.ingest.rate_limit_window_ms)?;
        if let Ok(origins) = env::var("CORS_ORIGIN") {
            config.ingest.cors_origins = origins
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect();
        }

        config.windowing.window_secs =
            env_parse("METRIC_WINDOW_SECONDS", config.windowing.window_secs)?;
        if config.windowing.window_secs <= 0 {
            return Err(Error::Config(
                "METRIC_WINDOW_SECONDS must be positive".to_string(),
            ));
        }

        // Error-rate buckets track the metric window; the baseline span is
        // configured in minutes and converted to whole buckets.
        config.detector.bucket_secs = config.windowing.window_secs;
        let baseline_minutes: i64 = env_parse("BASELINE_WINDOW_MINUTES", 60)?;
        if baseline_minutes <= 0 {
            return Err(Error::Config(
                "BASELINE_WINDOW_MINUTES must be positive".to_string(),
            ));
        }
        config.detector.baseline_buckets =
            ((baseline_minutes * 60) / config.detector.bucket_secs).max(1) as usize;

        config.detector.z_threshold =
            env_parse("Z_SCORE_THRESHOLD", config.detector.z_threshold)?;
        config.detector.rate_change_threshold = env_parse(
            "RATE_CHANGE_THRESHOLD",
            config.detector.rate_change_threshold,
        )?;
        config.detector.cooldown_ms =
            env_parse("ALERT_COOLDOWN_MS", config.detector.cooldown_ms)?;
        config.detector.latency_threshold_ms = env_parse(
            "LATENCY_THRESHOLD_MS",
            config.detector.latency_threshold_ms,
        )?;
        config.detector.downtime_minutes =
            env_parse("SERVICE_DOWNTIME_MINUTES", config.detector.downtime_minutes)?;

        config.sinks.webhook_url = env::var("ALERT_WEBHOOK_URL").ok();
        config.sinks.email_api_url = env::var("EMAIL_API_URL").ok();
        config.sinks.email_api_key = env::var("EMAIL_API_KEY").ok();
        config.sinks.email_from = env::var("EMAIL_FROM").ok();

        Ok(config)
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> Result<T> {
    match env::var(name) {
        Ok(raw) => raw
            .parse::<T>()
            .map_err(|_| Error::Config(format!("invalid value for {}: {:?}", name, raw))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.windowing.window_secs, 60);
        assert_eq!(config.windowing.grace_secs, 1);
        assert_eq!(config.detector.baseline_buckets, 60);
        assert_eq!(config.detector.recent_buckets, 5);
        assert_eq!(config.dedupe.bucket_secs, 5);
        assert_eq!(config.dispatcher.cooldown_critical_secs, 60);
        assert_eq!(config.bus.subscriber_capacity, 1024);
        assert_eq!(config.ingest.max_batch_size, 1000);
    }

    #[test]
    fn missing_database_url_is_fatal() {
        std::env::remove_var("DATABASE_URL");
        let err = Config::from_env().unwrap_err();
        assert_eq!(err.category(), "config");
    }
}
