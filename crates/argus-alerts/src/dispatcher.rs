//! Alert dispatch.
//!
//! Newly created or escalated alerts pass through per-severity cooldowns,
//! get batched with other unsent alerts for the same key inside the batch
//! window, and go out to every matching channel. Any successful delivery
//! marks the whole batch sent; failures leave the alerts unsent for the
//! next trigger on the same key.

use crate::sink::SinkRouter;
use argus_common::config::DispatcherConfig;
use argus_common::{Alert, AlertSeverity, AlertType, Clock, ProjectId, Result};
use argus_storage::{AlertRepository, ChannelRepository, ProjectRepository};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type CooldownKey = (String, AlertType, Option<ProjectId>);

/// Rate-limited, batching alert router
pub struct AlertDispatcher {
    alerts: Arc<dyn AlertRepository>,
    channels: Arc<dyn ChannelRepository>,
    projects: Arc<dyn ProjectRepository>,
    router: Arc<dyn SinkRouter>,
    clock: Arc<dyn Clock>,
    config: DispatcherConfig,
    last_sent: Mutex<HashMap<CooldownKey, DateTime<Utc>>>,
}

impl AlertDispatcher {
    pub fn new(
        alerts: Arc<dyn AlertRepository>,
        channels: Arc<dyn ChannelRepository>,
        projects: Arc<dyn ProjectRepository>,
        router: Arc<dyn SinkRouter>,
        clock: Arc<dyn Clock>,
        config: DispatcherConfig,
    ) -> Self {
        Self {
            alerts,
            channels,
            projects,
            router,
            clock,
            config,
            last_sent: Mutex::new(HashMap::new()),
        }
    }

    fn cooldown(&self, severity: AlertSeverity) -> Duration {
        let secs = match severity {
            AlertSeverity::Low => self.config.cooldown_low_secs,
            AlertSeverity::Medium => self.config.cooldown_medium_secs,
            AlertSeverity::High => self.config.cooldown_high_secs,
            AlertSeverity::Critical => self.config.cooldown_critical_secs,
        };
        Duration::seconds(secs)
    }

    /// Consider a newly created or escalated alert for delivery.
    ///
    /// Inside the cooldown for its key the alert simply stays unsent in
    /// storage; the next trigger on the same key will pick it up as part
    /// of a batch.
    pub async fn dispatch(&self, alert: &Alert) -> Result<()> {
        let now = self.clock.now();

        let project_id = match alert.project_id {
            Some(id) => Some(id),
            None => self.projects.resolve_service_project(&alert.service).await?,
        };
        let key: CooldownKey = (alert.service.clone(), alert.alert_type, project_id);

        {
            let last_sent = self.last_sent.lock().await;
            if let Some(last) = last_sent.get(&key) {
                let cooldown = self.cooldown(alert.severity);
                if now - *last < cooldown {
                    debug!(
                        service = %alert.service,
                        alert_type = alert.alert_type.as_str(),
                        severity = alert.severity.as_str(),
                        "inside cooldown, leaving alert unsent"
                    );
                    return Ok(());
                }
            }
        }

        // Everything unsent for this key inside the batch window goes out
        // together. The triggering alert is part of that set unless it
        // predates the window.
        let since = now - Duration::seconds(self.config.batch_window_secs);
        let mut batch = self
            .alerts
            .find_unsent_since(&alert.service, alert.alert_type, alert.project_id, since)
            .await?;
        if batch.is_empty() {
            batch.push(alert.clone());
        }

        let (subject, body) = if batch.len() > 1 {
            render_batch(alert, &batch)
        } else {
            render_single(&batch[0])
        };

        let delivered = self
            .deliver_all(project_id, &alert.service, &subject, &body)
            .await;

        if delivered {
            let ids: Vec<i64> = batch.iter().map(|a| a.id).collect();
            self.alerts.mark_sent(&ids, now).await?;
            self.last_sent.lock().await.insert(key, now);
            info!(
                service = %alert.service,
                alert_type = alert.alert_type.as_str(),
                batch_size = ids.len(),
                "alerts delivered and marked sent"
            );
        }
        Ok(())
    }

    /// Send to every matching channel; fall back to the project owner's
    /// email when none match. Returns whether any sink succeeded.
    async fn deliver_all(
        &self,
        project_id: Option<ProjectId>,
        service: &str,
        subject: &str,
        body: &str,
    ) -> bool {
        let mut targets = Vec::new();
        if let Some(project_id) = project_id {
            match self.channels.find_active_for_project(project_id).await {
                Ok(channels) => {
                    targets.extend(
                        channels
                            .into_iter()
                            .filter(|c| c.matches_service(service))
                            .map(|c| c.config),
                    );
                }
                Err(e) => warn!(error = %e, "failed to load alert channels"),
            }
        }

        if targets.is_empty() {
            return self.deliver_owner_fallback(project_id, subject, body).await;
        }

        let mut any_success = false;
        for config in &targets {
            match self.router.deliver(config, subject, body).await {
                Ok(()) => any_success = true,
                Err(e) => warn!(error = %e, "channel delivery failed"),
            }
        }
        any_success
    }

    async fn deliver_owner_fallback(
        &self,
        project_id: Option<ProjectId>,
        subject: &str,
        body: &str,
    ) -> bool {
        let Some(project_id) = project_id else {
            debug!("alert has no project and no channels, nothing to deliver to");
            return false;
        };
        let owner_email = match self.projects.find_by_id(project_id).await {
            Ok(Some(project)) => project.owner_email,
            Ok(None) => None,
            Err(e) => {
                warn!(error = %e, "failed to load project for email fallback");
                None
            }
        };
        let Some(address) = owner_email else {
            debug!("project owner has no email on file");
            return false;
        };

        match self.router.deliver_email(&address, subject, body).await {
            Ok(()) => true,
            Err(e) => {
                warn!(error = %e, "owner email fallback failed");
                false
            }
        }
    }
}

fn render_single(alert: &Alert) -> (String, String) {
    let subject = format!(
        "[{}] {} alert for {}",
        alert.severity.as_str(),
        alert.alert_type.as_str(),
        alert.service
    );
    let body = format!("{}\nat {}", alert.message, alert.created_at.to_rfc3339());
    (subject, body)
}

fn render_batch(trigger: &Alert, batch: &[Alert]) -> (String, String) {
    let first = batch
        .iter()
        .map(|a| a.created_at)
        .min()
        .unwrap_or(trigger.created_at);
    let last = batch
        .iter()
        .map(|a| a.created_at)
        .max()
        .unwrap_or(trigger.created_at);

    let subject = format!(
        "[{}] {} {} alerts for {}",
        trigger.severity.as_str(),
        batch.len(),
        trigger.alert_type.as_str(),
        trigger.service
    );

    let mut body = format!(
        "{} alerts between {} and {}\n",
        batch.len(),
        first.to_rfc3339(),
        last.to_rfc3339()
    );
    for alert in batch.iter().take(10) {
        body.push_str(&format!("- {}\n", alert.message));
    }
    if batch.len() > 10 {
        body.push_str(&format!("... and {} more\n", batch.len() - 10));
    }
    (subject, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use argus_common::{
        AlertChannel, ChannelConfig, Config, Error, ManualClock, NewAlert, Project,
    };
    use argus_storage::memory::{
        MemoryAlertRepository, MemoryChannelRepository, MemoryProjectRepository,
    };
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingRouter {
        deliveries: Mutex<Vec<(String, String, String)>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl SinkRouter for RecordingRouter {
        async fn deliver(
            &self,
            config: &ChannelConfig,
            subject: &str,
            body: &str,
        ) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::SinkDelivery("sink down".to_string()));
            }
            let kind = match config {
                ChannelConfig::ChatWebhook { .. } => "chat",
                ChannelConfig::Email { .. } => "email",
            };
            self.deliveries.lock().await.push((
                kind.to_string(),
                subject.to_string(),
                body.to_string(),
            ));
            Ok(())
        }

        async fn deliver_email(&self, _address: &str, subject: &str, body: &str) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(Error::SinkDelivery("sink down".to_string()));
            }
            self.deliveries.lock().await.push((
                "owner-email".to_string(),
                subject.to_string(),
                body.to_string(),
            ));
            Ok(())
        }
    }

    struct Fixture {
        alerts: Arc<MemoryAlertRepository>,
        channels: Arc<MemoryChannelRepository>,
        router: Arc<RecordingRouter>,
        clock: Arc<ManualClock>,
        dispatcher: AlertDispatcher,
        project_id: ProjectId,
    }

    async fn fixture() -> Fixture {
        let alerts = Arc::new(MemoryAlertRepository::new());
        let channels = Arc::new(MemoryChannelRepository::new());
        let projects = Arc::new(MemoryProjectRepository::new());
        let router = Arc::new(RecordingRouter::default());
        let clock = Arc::new(ManualClock::new(
            Utc.timestamp_opt(1_700_000_000, 0).single().unwrap(),
        ));

        let project_id = Uuid::new_v4();
        projects
            .add_project(Project {
                id: project_id,
                name: "prod".to_string(),
                owner_email: Some("owner@example.com".to_string()),
            })
            .await;
        projects
            .touch_service_binding("svc", project_id)
            .await
            .unwrap();

        let dispatcher = AlertDispatcher::new(
            alerts.clone(),
            channels.clone(),
            projects.clone(),
            router.clone(),
            clock.clone(),
            Config::default().dispatcher,
        );

        Fixture {
            alerts,
            channels,
            router,
            clock,
            dispatcher,
            project_id,
        }
    }

    fn chat_channel(project_id: ProjectId, service_filter: Option<&str>) -> AlertChannel {
        AlertChannel {
            id: Uuid::new_v4(),
            project_id,
            name: None,
            service_filter: service_filter.map(|s| s.to_string()),
            active: true,
            config: ChannelConfig::ChatWebhook {
                url: "https://hooks.example.com/argus".to_string(),
            },
        }
    }

    async fn stored_alert(
        fixture: &Fixture,
        severity: AlertSeverity,
        bucket_offset: i64,
    ) -> Alert {
        let created_at = fixture.clock.now() + Duration::seconds(bucket_offset * 5);
        fixture
            .alerts
            .insert_deduped(
                &NewAlert {
                    alert_type: AlertType::ErrorSpike,
                    severity,
                    message: format!("spike #{}", bucket_offset),
                    service: "svc".to_string(),
                    created_at,
                    project_id: None,
                },
                created_at.timestamp() / 5,
            )
            .await
            .unwrap()
            .alert
    }

    #[tokio::test]
    async fn single_alert_goes_to_matching_channel() {
        let fixture = fixture().await;
        fixture
            .channels
            .add(chat_channel(fixture.project_id, None))
            .await;

        let alert = stored_alert(&fixture, AlertSeverity::High, 0).await;
        fixture.clock.advance(Duration::seconds(1));
        fixture.dispatcher.dispatch(&alert).await.unwrap();

        let deliveries = fixture.router.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "chat");
        assert!(deliveries[0].1.contains("ERROR_SPIKE"));

        let stored = fixture.alerts.all().await;
        assert!(stored[0].sent);
        assert!(stored[0].last_sent_at.is_some());
    }

    #[tokio::test]
    async fn cooldown_leaves_alert_unsent() {
        let fixture = fixture().await;
        fixture
            .channels
            .add(chat_channel(fixture.project_id, None))
            .await;

        let first = stored_alert(&fixture, AlertSeverity::High, 0).await;
        fixture.dispatcher.dispatch(&first).await.unwrap();

        // A second alert two minutes later sits inside the 5-minute HIGH
        // cooldown.
        fixture.clock.advance(Duration::minutes(2));
        let second = stored_alert(&fixture, AlertSeverity::High, 30).await;
        fixture.dispatcher.dispatch(&second).await.unwrap();

        assert_eq!(fixture.router.deliveries.lock().await.len(), 1);
        let stored = fixture.alerts.all().await;
        let pending: Vec<_> = stored.iter().filter(|a| !a.sent).collect();
        assert_eq!(pending.len(), 1);

        // Once the cooldown lapses the unsent alert rides the next
        // trigger for the key.
        fixture.clock.advance(Duration::minutes(4));
        let third = stored_alert(&fixture, AlertSeverity::High, 80).await;
        fixture.dispatcher.dispatch(&third).await.unwrap();
        assert!(fixture.alerts.all().await.iter().all(|a| a.sent));
    }

    #[tokio::test]
    async fn batch_window_produces_summary_and_marks_all_sent() {
        let fixture = fixture().await;
        fixture
            .channels
            .add(chat_channel(fixture.project_id, None))
            .await;

        let _a = stored_alert(&fixture, AlertSeverity::Medium, 0).await;
        let _b = stored_alert(&fixture, AlertSeverity::Medium, 1).await;
        let c = stored_alert(&fixture, AlertSeverity::Medium, 2).await;

        fixture.clock.advance(Duration::seconds(30));
        fixture.dispatcher.dispatch(&c).await.unwrap();

        let deliveries = fixture.router.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1, "one summary, not three sends");
        assert!(deliveries[0].1.contains("3"));
        assert!(deliveries[0].2.contains("spike #0"));
        assert!(deliveries[0].2.contains("spike #2"));

        assert!(fixture.alerts.all().await.iter().all(|a| a.sent));
    }

    #[tokio::test]
    async fn no_matching_channel_falls_back_to_owner_email() {
        let fixture = fixture().await;
        // Only a channel scoped to a different service.
        fixture
            .channels
            .add(chat_channel(fixture.project_id, Some("other-svc")))
            .await;

        let alert = stored_alert(&fixture, AlertSeverity::High, 0).await;
        fixture.dispatcher.dispatch(&alert).await.unwrap();

        let deliveries = fixture.router.deliveries.lock().await;
        assert_eq!(deliveries.len(), 1);
        assert_eq!(deliveries[0].0, "owner-email");
        assert!(fixture.alerts.all().await[0].sent);
    }

    #[tokio::test]
    async fn sink_failure_keeps_alert_pending() {
        let fixture = fixture().await;
        fixture
            .channels
            .add(chat_channel(fixture.project_id, None))
            .await;
        fixture.router.fail.store(true, Ordering::SeqCst);

        let alert = stored_alert(&fixture, AlertSeverity::Critical, 0).await;
        fixture.dispatcher.dispatch(&alert).await.unwrap();
        assert!(!fixture.alerts.all().await[0].sent);

        // Recovery: the next dispatch for the key delivers the backlog.
        fixture.router.fail.store(false, Ordering::SeqCst);
        fixture.clock.advance(Duration::minutes(2));
        let next = stored_alert(&fixture, AlertSeverity::Critical, 30).await;
        fixture.dispatcher.dispatch(&next).await.unwrap();
        assert!(fixture.alerts.all().await.iter().all(|a| a.sent));
    }

    #[tokio::test]
    async fn unknown_service_without_project_is_a_quiet_noop() {
        let fixture = fixture().await;
        let created_at = fixture.clock.now();
        let alert = fixture
            .alerts
            .insert_deduped(
                &NewAlert {
                    alert_type: AlertType::ServiceDown,
                    severity: AlertSeverity::High,
                    message: "down".to_string(),
                    service: "unbound-svc".to_string(),
                    created_at,
                    project_id: None,
                },
                created_at.timestamp() / 5,
            )
            .await
            .unwrap()
            .alert;

        fixture.dispatcher.dispatch(&alert).await.unwrap();
        assert!(fixture.router.deliveries.lock().await.is_empty());
        assert!(!fixture.alerts.all().await[0].sent);
    }
}
