//! Tumbling-window metric aggregation.
//!
//! Windows are non-overlapping, aligned to multiples of the window length
//! from the epoch. Every incoming log updates its window and yields a
//! snapshot of partial samples; closed windows are finalized and dropped by
//! the drain tick once their grace period passes.

use argus_common::config::WindowConfig;
use argus_common::{LogRecord, MetricSample, MetricType};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

/// Mutable state of one open window for one service
#[derive(Debug)]
pub struct WindowState {
    pub service: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub log_count: u64,
    pub error_count: u64,
    latencies: VecDeque<f64>,
    latency_cap: usize,
}

impl WindowState {
    fn new(service: &str, window_start: DateTime<Utc>, window_secs: i64, latency_cap: usize) -> Self {
        Self {
            service: service.to_string(),
            window_start,
            window_end: window_start + chrono::Duration::seconds(window_secs),
            log_count: 0,
            error_count: 0,
            latencies: VecDeque::new(),
            latency_cap,
        }
    }

    fn record(&mut self, log: &LogRecord) {
        self.log_count += 1;
        if log.level.is_error() {
            self.error_count += 1;
        }
        if let Some(latency) = log.latency_ms() {
            if self.latencies.len() == self.latency_cap {
                self.latencies.pop_front();
            }
            self.latencies.push_back(latency);
        }
    }

    fn latency_p95(&self) -> Option<f64> {
        percentile(self.latencies.iter().copied(), 0.95)
    }

    /// Samples for this window while it is still open. LOG_COUNT always,
    /// ERROR_COUNT once nonzero, LATENCY_P95/THROUGHPUT once latencies
    /// exist. Partial windows are clamped to `now` on the right edge.
    fn partial_samples(&self, now: DateTime<Utc>, window_secs: i64) -> Vec<MetricSample> {
        let window_end = self.window_end.min(now);
        let mut samples = vec![self.sample(MetricType::LogCount, self.log_count as f64, window_end)];
        if self.error_count > 0 {
            samples.push(self.sample(MetricType::ErrorCount, self.error_count as f64, window_end));
        }
        if let Some(p95) = self.latency_p95() {
            samples.push(self.sample(MetricType::LatencyP95, p95, window_end));
            samples.push(self.sample(
                MetricType::Throughput,
                self.log_count as f64 / window_secs as f64,
                window_end,
            ));
        }
        samples
    }

    /// Samples for this window once it has closed. THROUGHPUT is always
    /// present for a closed window; LATENCY_P95 only when latencies were
    /// observed.
    fn final_samples(&self, window_secs: i64) -> Vec<MetricSample> {
        let window_end = self.window_end;
        let mut samples = vec![self.sample(MetricType::LogCount, self.log_count as f64, window_end)];
        if self.error_count > 0 {
            samples.push(self.sample(MetricType::ErrorCount, self.error_count as f64, window_end));
        }
        if let Some(p95) = self.latency_p95() {
            samples.push(self.sample(MetricType::LatencyP95, p95, window_end));
        }
        samples.push(self.sample(
            MetricType::Throughput,
            self.log_count as f64 / window_secs as f64,
            window_end,
        ));
        samples
    }

    fn sample(&self, metric_type: MetricType, value: f64, window_end: DateTime<Utc>) -> MetricSample {
        MetricSample {
            service: self.service.clone(),
            metric_type,
            value,
            window_start: self.window_start,
            window_end,
        }
    }
}

/// Sorted-index percentile over a bounded set: sorted[floor(q * n)],
/// clamped to the last element.
fn percentile(values: impl Iterator<Item = f64>, q: f64) -> Option<f64> {
    let mut sorted: Vec<f64> = values.collect();
    if sorted.is_empty() {
        return None;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let idx = ((sorted.len() as f64 * q).floor() as usize).min(sorted.len() - 1);
    Some(sorted[idx])
}

/// Per-service open windows, keyed by window start (epoch seconds)
#[derive(Debug, Default)]
struct ServiceWindows {
    open: BTreeMap<i64, WindowState>,
}

/// Per-(service, window-start) tumbling aggregation.
///
/// State is partitioned by service: the outer map takes a coarse read
/// lock, updates for one service serialize on that service's own lock.
pub struct MetricAggregator {
    config: WindowConfig,
    services: RwLock<HashMap<String, Arc<Mutex<ServiceWindows>>>>,
}

impl MetricAggregator {
    pub fn new(config: WindowConfig) -> Self {
        Self {
            config,
            services: RwLock::new(HashMap::new()),
        }
    }

    fn align(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        let secs = ts.timestamp().div_euclid(self.config.window_secs) * self.config.window_secs;
        Utc.timestamp_opt(secs, 0).single().unwrap_or(ts)
    }

    async fn service_entry(&self, service: &str) -> Arc<Mutex<ServiceWindows>> {
        if let Some(entry) = self.services.read().await.get(service) {
            return entry.clone();
        }
        let mut services = self.services.write().await;
        services
            .entry(service.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(ServiceWindows::default())))
            .clone()
    }

    /// Fold one log into its window and return the current partial samples
    /// for that window.
    pub async fn on_log(&self, log: &LogRecord, now: DateTime<Utc>) -> Vec<MetricSample> {
        let window_start = self.align(log.timestamp);
        let entry = self.service_entry(&log.service).await;
        let mut windows = entry.lock().await;

        let state = windows
            .open
            .entry(window_start.timestamp())
            .or_insert_with(|| {
                WindowState::new(
                    &log.service,
                    window_start,
                    self.config.window_secs,
                    self.config.max_latencies_per_window,
                )
            });
        state.record(log);
        state.partial_samples(now, self.config.window_secs)
    }

    /// Finalize and drop every window whose end passed at least the grace
    /// period ago. Each (service, window-start) finalizes at most once.
    pub async fn drain_completed(&self, now: DateTime<Utc>) -> Vec<MetricSample> {
        let cutoff = now - chrono::Duration::seconds(self.config.grace_secs);
        let entries: Vec<Arc<Mutex<ServiceWindows>>> =
            self.services.read().await.values().cloned().collect();

        let mut finalized = Vec::new();
        for entry in entries {
            let mut windows = entry.lock().await;
            let closed: Vec<i64> = windows
                .open
                .iter()
                .filter(|(_, state)| state.window_end <= cutoff)
                .map(|(start, _)| *start)
                .collect();
            for start in closed {
                if let Some(state) = windows.open.remove(&start) {
                    debug!(
                        service = %state.service,
                        window_start = start,
                        log_count = state.log_count,
                        "finalizing window"
                    );
                    finalized.extend(state.final_samples(self.config.window_secs));
                }
            }
        }
        finalized
    }

    /// Number of currently open windows, for diagnostics and drain tests
    pub async fn open_window_count(&self) -> usize {
        let entries: Vec<Arc<Mutex<ServiceWindows>>> =
            self.services.read().await.values().cloned().collect();
        let mut count = 0;
        for entry in entries {
            count += entry.lock().await.open.len();
        }
        count
    }
}
