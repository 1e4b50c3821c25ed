//! The pipeline orchestrator.
//!
//! Owns every core component and the two periodic tickers (metric
//! finalization, liveness watchdog). The hot path runs once per persisted
//! log, fed either by the change listener or directly by in-process
//! ingest; the shared processed-id set keeps the two paths from processing
//! a record twice.

use argus_alerts::{AlertDeduper, AlertDispatcher, SinkRouter};
use argus_anomaly::AnomalyDetector;
use argus_bus::EventBus;
use argus_common::{
    Clock, Config, IngestReport, LogRecord, NewAlert, NewLogRecord, Result, Span,
    SpanIngestReport,
};
use argus_ingest::IngestionBridge;
use argus_metrics::MetricAggregator;
use argus_storage::postgres;
use argus_storage::{
    AlertRepository, ChangeListener, ChannelRepository, DedupeOutcome, LogHandler, LogRepository,
    MetricRepository, ProcessedSet, ProjectRepository, SpanRepository,
};
use async_trait::async_trait;
use sqlx::postgres::PgPool;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Everything the processor needs from the outside world, injected at
/// startup. No hidden globals: the binary builds this once and hands it
/// over.
pub struct ProcessorDeps {
    pub logs: Arc<dyn LogRepository>,
    pub spans: Arc<dyn SpanRepository>,
    pub metrics: Arc<dyn MetricRepository>,
    pub alerts: Arc<dyn AlertRepository>,
    pub channels: Arc<dyn ChannelRepository>,
    pub projects: Arc<dyn ProjectRepository>,
    pub router: Arc<dyn SinkRouter>,
    pub clock: Arc<dyn Clock>,
}

/// The assembled pipeline
pub struct Processor {
    config: Config,
    clock: Arc<dyn Clock>,
    logs: Arc<dyn LogRepository>,
    metrics: Arc<dyn MetricRepository>,
    projects: Arc<dyn ProjectRepository>,
    aggregator: MetricAggregator,
    detector: AnomalyDetector,
    deduper: AlertDeduper,
    dispatcher: AlertDispatcher,
    bridge: IngestionBridge,
    bus: EventBus,
    processed: Arc<ProcessedSet>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    in_flight: Arc<AtomicUsize>,
    stopped: AtomicBool,
}

impl Processor {
    pub fn new(config: Config, deps: ProcessorDeps) -> Self {
        let aggregator = MetricAggregator::new(config.windowing.clone());
        let detector = AnomalyDetector::new(config.detector.clone());
        let deduper = AlertDeduper::new(deps.alerts.clone(), config.dedupe.clone());
        let dispatcher = AlertDispatcher::new(
            deps.alerts.clone(),
            deps.channels.clone(),
            deps.projects.clone(),
            deps.router.clone(),
            deps.clock.clone(),
            config.dispatcher.clone(),
        );
        let bridge = IngestionBridge::new(
            deps.logs.clone(),
            deps.spans.clone(),
            config.ingest.clone(),
        );
        let bus = EventBus::new(config.bus.subscriber_capacity);
        let processed = Arc::new(ProcessedSet::new(config.listener.processed_set_capacity));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            clock: deps.clock,
            logs: deps.logs,
            metrics: deps.metrics,
            projects: deps.projects,
            aggregator,
            detector,
            deduper,
            dispatcher,
            bridge,
            bus,
            processed,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            in_flight: Arc::new(AtomicUsize::new(0)),
            stopped: AtomicBool::new(false),
            config,
        }
    }

    /// The in-process event bus, for SSE fan-out and tests
    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// A shutdown signal receiver for collaborator tasks (SSE connections,
    /// custom subscribers) to select on.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Start the periodic tickers: the liveness watchdog on its own
    /// interval, then metric finalization every window.
    pub async fn start(self: &Arc<Self>) {
        let mut tasks = self.tasks.lock().await;

        let watchdog = {
            let processor = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_secs(self.config.processor.watchdog_interval_secs.max(1));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            processor.run_watchdog_once().await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                return;
                            }
                        }
                    }
                }
            })
        };
        tasks.push(watchdog);

        let finalize = {
            let processor = self.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let period = Duration::from_secs(self.config.windowing.window_secs.max(1) as u64);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            processor.run_finalize_once().await;
                        }
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                // One last drain so closed windows are not lost.
                                processor.run_finalize_once().await;
                                return;
                            }
                        }
                    }
                }
            })
        };
        tasks.push(finalize);

        info!("processor tickers started");
    }

    /// Attach the change-notification listener on its own storage session.
    /// Runs the catch-up pass on connect and after every reconnect.
    pub async fn start_change_listener(self: &Arc<Self>, pool: PgPool) {
        let mut listener = ChangeListener::new(
            pool,
            self.logs.clone(),
            self.processed.clone(),
            self.config.listener.clone(),
        );
        listener.register_handler(Arc::new(ProcessorLogHandler {
            processor: self.clone(),
        }));
        let handle = listener.start(self.shutdown_tx.subscribe());
        self.tasks.lock().await.push(handle);
    }

    /// Ingest a log batch and feed the accepted records straight through
    /// the hot path. Ids are marked processed so the notification path
    /// skips them.
    pub async fn ingest_logs(
        &self,
        batch: Vec<NewLogRecord>,
        default_service: Option<&str>,
    ) -> Result<IngestReport> {
        let _guard = InFlightGuard::enter(&self.in_flight);

        let outcome = self.bridge.ingest_logs(batch, default_service).await?;
        for record in &outcome.records {
            if self.processed.mark(record.id) {
                self.on_log(record).await;
            }
        }
        Ok(outcome.report)
    }

    /// Ingest a span batch
    pub async fn ingest_spans(
        &self,
        batch: Vec<Span>,
        default_service: Option<&str>,
    ) -> Result<SpanIngestReport> {
        let _guard = InFlightGuard::enter(&self.in_flight);
        self.bridge.ingest_spans(batch, default_service).await
    }

    /// The per-log hot path. Failures downstream of the durable write are
    /// logged and swallowed; the record is already safe in storage.
    pub async fn on_log(&self, record: &LogRecord) {
        let now = self.clock.now();
        let record_arc = Arc::new(record.clone());
        self.bus.publish_log(record_arc);

        let partials = self.aggregator.on_log(record, now).await;
        for sample in &partials {
            if let Err(e) = self.metrics.upsert(sample).await {
                warn!(
                    service = %sample.service,
                    metric = sample.metric_type.as_str(),
                    error = %e,
                    "partial metric upsert failed"
                );
            }
            self.bus.publish_metric(Arc::new(sample.clone()));
        }

        let alerts = self.detector.observe_log(record, now).await;
        for alert in alerts {
            self.route_alert(alert).await;
        }
    }

    /// Finalize closed windows: persist, publish, and run the metric-based
    /// anomaly rules over them.
    pub async fn run_finalize_once(&self) {
        let now = self.clock.now();
        let finalized = self.aggregator.drain_completed(now).await;
        if finalized.is_empty() {
            return;
        }
        debug!(samples = finalized.len(), "finalizing metric windows");

        for sample in &finalized {
            if let Err(e) = self.metrics.upsert(sample).await {
                warn!(
                    service = %sample.service,
                    metric = sample.metric_type.as_str(),
                    error = %e,
                    "finalized metric upsert failed"
                );
            }
            self.bus.publish_metric(Arc::new(sample.clone()));
        }

        for alert in self.detector.evaluate_metrics(&finalized, now) {
            self.route_alert(alert).await;
        }
    }

    /// Run one liveness sweep
    pub async fn run_watchdog_once(&self) {
        let now = self.clock.now();
        for alert in self.detector.check_liveness(now).await {
            self.route_alert(alert).await;
        }
    }

    /// Dedupe an alert and, when it created or escalated a row, publish it
    /// and hand it to the dispatcher.
    async fn route_alert(&self, mut alert: NewAlert) {
        if alert.project_id.is_none() {
            match self.projects.resolve_service_project(&alert.service).await {
                Ok(project_id) => alert.project_id = project_id,
                Err(e) => warn!(service = %alert.service, error = %e,
                                "project resolution failed"),
            }
        }

        let result = match self.deduper.insert_deduped(&alert).await {
            Ok(result) => result,
            Err(e) => {
                error!(
                    service = %alert.service,
                    alert_type = alert.alert_type.as_str(),
                    error = %e,
                    "alert dedupe failed"
                );
                return;
            }
        };

        match result.outcome {
            DedupeOutcome::Created | DedupeOutcome::Updated => {
                self.bus.publish_alert(Arc::new(result.alert.clone()));
                if let Err(e) = self.dispatcher.dispatch(&result.alert).await {
                    warn!(
                        service = %result.alert.service,
                        error = %e,
                        "alert dispatch failed"
                    );
                }
            }
            DedupeOutcome::Skipped => {
                debug!(
                    service = %result.alert.service,
                    alert_type = result.alert.alert_type.as_str(),
                    "duplicate alert skipped"
                );
            }
        }
    }

    /// Graceful, idempotent shutdown: stop the tickers (each runs a final
    /// drain), close the listener, and wait out in-flight ingest batches
    /// up to the drain timeout.
    pub async fn shutdown(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            debug!("shutdown already in progress");
            return;
        }
        info!("processor shutting down");
        let _ = self.shutdown_tx.send(true);

        let drain_deadline = Duration::from_millis(self.config.processor.drain_timeout_ms);
        let in_flight = self.in_flight.clone();
        let drained = tokio::time::timeout(drain_deadline, async move {
            while in_flight.load(Ordering::SeqCst) > 0 {
                tokio::time::sleep(Duration::from_millis(20)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("in-flight ingest batches did not drain before the timeout");
        }

        let mut tasks = self.tasks.lock().await;
        for task in tasks.drain(..) {
            if tokio::time::timeout(drain_deadline, task).await.is_err() {
                warn!("background task did not stop before the timeout");
            }
        }
        info!("processor shutdown complete");
    }
}

/// Bridges the change listener onto the processor hot path
struct ProcessorLogHandler {
    processor: Arc<Processor>,
}

#[async_trait]
impl LogHandler for ProcessorLogHandler {
    async fn on_log(&self, log: &LogRecord) -> Result<()> {
        self.processor.on_log(log).await;
        Ok(())
    }
}

/// Counts an ingest batch as in flight until dropped
struct InFlightGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> InFlightGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Build a processor wired to Postgres, run migrations, and start every
/// background task in the documented order: migrations, watchdog and
/// finalize tickers, change listener (which runs the catch-up pass).
pub async fn start_postgres_processor(config: Config, router: Arc<dyn SinkRouter>) -> Result<Arc<Processor>> {
    let pool = postgres::connect(&config.storage).await?;
    postgres::run_migrations(&pool).await?;

    let deps = ProcessorDeps {
        logs: Arc::new(postgres::PostgresLogRepository::new(pool.clone())),
        spans: Arc::new(postgres::PostgresSpanRepository::new(pool.clone())),
        metrics: Arc::new(postgres::PostgresMetricRepository::new(pool.clone())),
        alerts: Arc::new(postgres::PostgresAlertRepository::new(pool.clone())),
        channels: Arc::new(postgres::PostgresChannelRepository::new(pool.clone())),
        projects: Arc::new(postgres::PostgresProjectRepository::new(pool.clone())),
        router,
        clock: Arc::new(argus_common::SystemClock),
    };

    let processor = Arc::new(Processor::new(config, deps));
    processor.start().await;
    processor.start_change_listener(pool).await;
    Ok(processor)
}
