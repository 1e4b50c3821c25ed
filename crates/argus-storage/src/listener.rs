//! Change-notification listener.
//!
//! Holds a dedicated Postgres session LISTENing on the log insert channel.
//! Each notification carries a log id; the listener fetches the full
//! record and fans it out to the registered handlers. A catch-up pass runs
//! on start and after every reconnect, and a bounded set of recently
//! processed ids absorbs the overlap between catch-up and live delivery.

use crate::repository::LogRepository;
use argus_common::config::ListenerConfig;
use argus_common::{LogId, LogRecord, Result};
use async_trait::async_trait;
use sqlx::postgres::{PgListener, PgPool};
use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Receives every persisted log exactly once (per process)
#[async_trait]
pub trait LogHandler: Send + Sync {
    async fn on_log(&self, log: &LogRecord) -> Result<()>;
}

/// Bounded set of recently processed log ids with FIFO eviction.
///
/// Shared between the listener and the in-process ingest path so a record
/// fed directly into the pipeline is not re-processed when its
/// notification arrives.
#[derive(Debug)]
pub struct ProcessedSet {
    inner: Mutex<ProcessedSetInner>,
    capacity: usize,
}

#[derive(Debug, Default)]
struct ProcessedSetInner {
    seen: HashSet<LogId>,
    order: VecDeque<LogId>,
}

impl ProcessedSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ProcessedSetInner::default()),
            capacity: capacity.max(1),
        }
    }

    /// Record an id. Returns false when it was already present.
    pub fn mark(&self, id: LogId) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.seen.insert(id) {
            return false;
        }
        inner.order.push_back(id);
        if inner.order.len() > self.capacity {
            if let Some(evicted) = inner.order.pop_front() {
                inner.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn contains(&self, id: LogId) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.seen.contains(&id)
    }

    pub fn len(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Long-lived subscriber on the storage change channel
pub struct ChangeListener {
    pool: PgPool,
    logs: Arc<dyn LogRepository>,
    handlers: Vec<Arc<dyn LogHandler>>,
    processed: Arc<ProcessedSet>,
    config: ListenerConfig,
}

impl ChangeListener {
    pub fn new(
        pool: PgPool,
        logs: Arc<dyn LogRepository>,
        processed: Arc<ProcessedSet>,
        config: ListenerConfig,
    ) -> Self {
        Self {
            pool,
            logs,
            handlers: Vec::new(),
            processed,
            config,
        }
    }

    /// Register a handler. All handlers see every record; a failing
    /// handler never blocks the others.
    pub fn register_handler(&mut self, handler: Arc<dyn LogHandler>) {
        self.handlers.push(handler);
    }

    /// Run the receive loop until the shutdown signal flips.
    ///
    /// Connection loss triggers an exponential-backoff reconnect; each
    /// successful (re)connect starts with a catch-up pass so notifications
    /// missed while disconnected are recovered from storage.
    pub fn start(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut backoff = Duration::from_millis(self.config.backoff_initial_ms);
            let backoff_max = Duration::from_millis(self.config.backoff_max_ms);

            loop {
                if *shutdown.borrow() {
                    break;
                }

                let mut listener = match PgListener::connect_with(&self.pool).await {
                    Ok(listener) => listener,
                    Err(e) => {
                        warn!(error = %e, delay_ms = backoff.as_millis() as u64,
                              "change-channel connect failed, backing off");
                        if sleep_or_shutdown(backoff, &mut shutdown).await {
                            break;
                        }
                        backoff = (backoff * 2).min(backoff_max);
                        continue;
                    }
                };
                if let Err(e) = listener.listen(&self.config.channel).await {
                    warn!(error = %e, channel = %self.config.channel,
                          "LISTEN failed, backing off");
                    if sleep_or_shutdown(backoff, &mut shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(backoff_max);
                    continue;
                }

                info!(channel = %self.config.channel, "change-channel connected");
                backoff = Duration::from_millis(self.config.backoff_initial_ms);

                // Recover whatever was committed while we were not
                // listening. The processed set keeps replays idempotent.
                if let Err(e) = self.catch_up().await {
                    error!(error = %e, "catch-up pass failed");
                }

                loop {
                    tokio::select! {
                        changed = shutdown.changed() => {
                            if changed.is_err() || *shutdown.borrow() {
                                info!("change listener shutting down");
                                return;
                            }
                        }
                        notification = listener.recv() => {
                            match notification {
                                Ok(notification) => {
                                    self.handle_payload(notification.payload()).await;
                                }
                                Err(e) => {
                                    warn!(error = %e, "change-channel receive failed, reconnecting");
                                    break;
                                }
                            }
                        }
                    }
                }

                if sleep_or_shutdown(backoff, &mut shutdown).await {
                    break;
                }
                backoff = (backoff * 2).min(backoff_max);
            }
        })
    }

    /// Feed the most recent records through the handlers, skipping any the
    /// process has already seen.
    pub async fn catch_up(&self) -> Result<()> {
        let records = self.logs.find_recent(self.config.catchup_limit).await?;
        let mut replayed = 0usize;
        for record in &records {
            if self.processed.mark(record.id) {
                self.dispatch(record).await;
                replayed += 1;
            }
        }
        info!(
            fetched = records.len(),
            replayed, "catch-up pass complete"
        );
        Ok(())
    }

    /// Handle one raw notification payload
    async fn handle_payload(&self, payload: &str) {
        let id: LogId = match payload.trim().parse() {
            Ok(id) => id,
            Err(_) => {
                warn!(payload, "dropping change notification with non-numeric id");
                return;
            }
        };

        if !self.processed.mark(id) {
            debug!(id, "skipping already-processed log");
            return;
        }

        match self.logs.find_by_id(id).await {
            Ok(Some(record)) => self.dispatch(&record).await,
            Ok(None) => warn!(id, "notified log id not found in storage"),
            Err(e) => error!(id, error = %e, "failed to fetch notified log"),
        }
    }

    /// Run every handler over the record. Handler failures are logged and
    /// swallowed so one bad subscriber cannot stall the stream.
    async fn dispatch(&self, record: &LogRecord) {
        let results = futures::future::join_all(
            self.handlers.iter().map(|handler| handler.on_log(record)),
        )
        .await;
        for result in results {
            if let Err(e) = result {
                error!(id = record.id, error = %e, "log handler failed");
            }
        }
    }
}

async fn sleep_or_shutdown(delay: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        changed = shutdown.changed() => changed.is_err() || *shutdown.borrow(),
    }
}
