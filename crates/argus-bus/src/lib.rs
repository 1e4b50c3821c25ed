//! Argus Bus - in-process pub/sub for log, metric and alert events.
//!
//! One broadcast channel per topic. Publishing never blocks: a subscriber
//! that falls behind loses the oldest events in its queue and its handle
//! counts how many were dropped. Each SSE connection holds one subscriber
//! for its lifetime; dropping the handle unsubscribes.

use argus_common::{Alert, LogRecord, MetricSample};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};

/// Topics carried by the bus
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    LogReceived,
    MetricAggregated,
    AlertTriggered,
}

impl Topic {
    pub fn as_str(&self) -> &'static str {
        match self {
            Topic::LogReceived => "log.received",
            Topic::MetricAggregated => "metric.aggregated",
            Topic::AlertTriggered => "alert.triggered",
        }
    }
}

/// In-process event bus with bounded per-subscriber queues
#[derive(Debug, Clone)]
pub struct EventBus {
    logs: broadcast::Sender<Arc<LogRecord>>,
    metrics: broadcast::Sender<Arc<MetricSample>>,
    alerts: broadcast::Sender<Arc<Alert>>,
}

impl EventBus {
    /// Create a bus whose subscribers buffer at most `capacity` events
    pub fn new(capacity: usize) -> Self {
        let (logs, _) = broadcast::channel(capacity.max(1));
        let (metrics, _) = broadcast::channel(capacity.max(1));
        let (alerts, _) = broadcast::channel(capacity.max(1));
        Self {
            logs,
            metrics,
            alerts,
        }
    }

    /// Publish a persisted log record on `log.received`
    pub fn publish_log(&self, record: Arc<LogRecord>) {
        // send only fails when there are no subscribers, which is fine
        let _ = self.logs.send(record);
    }

    /// Publish a metric sample on `metric.aggregated`
    pub fn publish_metric(&self, sample: Arc<MetricSample>) {
        let _ = self.metrics.send(sample);
    }

    /// Publish an alert on `alert.triggered`
    pub fn publish_alert(&self, alert: Arc<Alert>) {
        debug!(
            service = %alert.service,
            alert_type = alert.alert_type.as_str(),
            severity = alert.severity.as_str(),
            "publishing alert event"
        );
        let _ = self.alerts.send(alert);
    }

    pub fn subscribe_logs(&self) -> Subscriber<Arc<LogRecord>> {
        Subscriber::new(Topic::LogReceived, self.logs.subscribe())
    }

    pub fn subscribe_metrics(&self) -> Subscriber<Arc<MetricSample>> {
        Subscriber::new(Topic::MetricAggregated, self.metrics.subscribe())
    }

    pub fn subscribe_alerts(&self) -> Subscriber<Arc<Alert>> {
        Subscriber::new(Topic::AlertTriggered, self.alerts.subscribe())
    }

    /// Current subscriber counts, for diagnostics
    pub fn subscriber_counts(&self) -> (usize, usize, usize) {
        (
            self.logs.receiver_count(),
            self.metrics.receiver_count(),
            self.alerts.receiver_count(),
        )
    }
}

/// Receiving half of a bus subscription.
///
/// `recv` skips over dropped events, accumulating their count, and returns
/// `None` once the bus itself is gone.
#[derive(Debug)]
pub struct Subscriber<T: Clone> {
    topic: Topic,
    rx: broadcast::Receiver<T>,
    dropped: u64,
}

impl<T: Clone> Subscriber<T> {
    fn new(topic: Topic, rx: broadcast::Receiver<T>) -> Self {
        Self {
            topic,
            rx,
            dropped: 0,
        }
    }

    /// Receive the next event, waiting if none is queued
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.rx.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    self.dropped += missed;
                    warn!(
                        topic = self.topic.as_str(),
                        missed,
                        total_dropped = self.dropped,
                        "subscriber lagged, oldest events dropped"
                    );
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `Ok(None)` when the queue is empty
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.rx.try_recv() {
                Ok(event) => return Some(event),
                Err(broadcast::error::TryRecvError::Lagged(missed)) => {
                    self.dropped += missed;
                }
                Err(_) => return None,
            }
        }
    }

    pub fn topic(&self) -> Topic {
        self.topic
    }

    /// Events this subscriber has lost to backpressure
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_common::{LogLevel, MetricType};
    use chrono::Utc;
    use std::collections::HashMap;

    fn log(id: i64) -> Arc<LogRecord> {
        Arc::new(LogRecord {
            id,
            timestamp: Utc::now(),
            level: LogLevel::Info,
            service: "svc".to_string(),
            message: format!("event {}", id),
            metadata: HashMap::new(),
            trace_id: None,
            span_id: None,
        })
    }

    #[tokio::test]
    async fn delivers_events_in_order() {
        let bus = EventBus::new(16);
        let mut sub = bus.subscribe_logs();

        bus.publish_log(log(1));
        bus.publish_log(log(2));

        assert_eq!(sub.recv().await.unwrap().id, 1);
        assert_eq!(sub.recv().await.unwrap().id, 2);
        assert_eq!(sub.dropped(), 0);
    }

    #[tokio::test]
    async fn publish_without_subscribers_is_a_noop() {
        let bus = EventBus::new(16);
        bus.publish_metric(Arc::new(MetricSample {
            service: "svc".to_string(),
            metric_type: MetricType::LogCount,
            value: 1.0,
            window_start: Utc::now(),
            window_end: Utc::now(),
        }));
    }

    #[tokio::test]
    async fn slow_subscriber_drops_oldest_and_counts() {
        let bus = EventBus::new(4);
        let mut sub = bus.subscribe_logs();

        for id in 0..10 {
            bus.publish_log(log(id));
        }

        // The first receive skips the overwritten events and reports them.
        let first = sub.recv().await.unwrap();
        assert_eq!(first.id, 6);
        assert_eq!(sub.dropped(), 6);

        // The remaining buffered events arrive intact.
        assert_eq!(sub.recv().await.unwrap().id, 7);
        assert_eq!(sub.recv().await.unwrap().id, 8);
        assert_eq!(sub.recv().await.unwrap().id, 9);
    }

    #[tokio::test]
    async fn each_subscriber_has_its_own_queue() {
        let bus = EventBus::new(8);
        let mut fast = bus.subscribe_logs();
        let mut late = bus.subscribe_logs();
        assert_eq!(bus.subscriber_counts(), (2, 0, 0));

        bus.publish_log(log(1));
        assert_eq!(fast.recv().await.unwrap().id, 1);
        assert_eq!(late.recv().await.unwrap().id, 1);

        drop(late);
        assert_eq!(bus.subscriber_counts(), (1, 0, 0));
    }

    #[tokio::test]
    async fn try_recv_never_blocks() {
        let bus = EventBus::new(8);
        let mut sub = bus.subscribe_alerts();
        assert_eq!(sub.topic(), Topic::AlertTriggered);
        assert_eq!(sub.topic().as_str(), "alert.triggered");
        assert!(sub.try_recv().is_none());

        bus.publish_alert(Arc::new(argus_common::Alert {
            id: 1,
            project_id: None,
            alert_type: argus_common::AlertType::ErrorSpike,
            severity: argus_common::AlertSeverity::Low,
            message: "m".to_string(),
            service: "svc".to_string(),
            resolved: false,
            created_at: Utc::now(),
            resolved_at: None,
            sent: false,
            last_sent_at: None,
            time_bucket: 0,
        }));
        assert!(sub.try_recv().is_some());
        assert!(sub.try_recv().is_none());
    }
}
