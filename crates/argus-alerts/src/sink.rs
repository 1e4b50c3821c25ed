//! Delivery sinks.
//!
//! Channels are routed by their tagged config: chat channels post to a
//! webhook, email channels go through the configured provider API. Every
//! outbound call runs under a deadline so a stuck sink cannot wedge the
//! dispatcher.

use argus_common::config::SinkConfig;
use argus_common::{ChannelConfig, Error, Result};
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info};

/// Routes a rendered alert to the transport behind a channel config
#[async_trait]
pub trait SinkRouter: Send + Sync {
    /// Deliver to a configured channel
    async fn deliver(&self, config: &ChannelConfig, subject: &str, body: &str) -> Result<()>;

    /// Deliver directly to an email address (project-owner fallback)
    async fn deliver_email(&self, address: &str, subject: &str, body: &str) -> Result<()>;
}

/// Production router speaking HTTP to chat webhooks and the email provider
pub struct HttpSinkRouter {
    client: reqwest::Client,
    config: SinkConfig,
    timeout: Duration,
}

impl HttpSinkRouter {
    pub fn new(config: SinkConfig, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::SinkDelivery(format!("failed to build HTTP client: {}", e)))?;
        Ok(Self {
            client,
            config,
            timeout,
        })
    }

    async fn post_webhook(&self, url: &str, subject: &str, body: &str) -> Result<()> {
        let payload = serde_json::json!({
            "text": format!("*{}*\n{}", subject, body),
        });

        let send = self.client.post(url).json(&payload).send();
        let response = tokio::time::timeout(self.timeout, send)
            .await
            .map_err(|_| Error::Timeout(format!("webhook call to {} timed out", url)))?
            .map_err(|e| Error::SinkDelivery(format!("webhook request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::SinkDelivery(format!(
                "webhook returned status {}",
                response.status()
            )));
        }
        debug!(url, "webhook delivery succeeded");
        Ok(())
    }

    async fn post_email(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let api_url = self.config.email_api_url.as_deref().ok_or_else(|| {
            Error::SinkDelivery("email provider is not configured".to_string())
        })?;
        let from = self.config.email_from.as_deref().unwrap_or("alerts@argus");

        let payload = serde_json::json!({
            "from": from,
            "to": to,
            "subject": subject,
            "text": body,
        });

        let mut request = self.client.post(api_url).json(&payload);
        if let Some(key) = self.config.email_api_key.as_deref() {
            request = request.bearer_auth(key);
        }

        let response = tokio::time::timeout(self.timeout, request.send())
            .await
            .map_err(|_| Error::Timeout("email provider call timed out".to_string()))?
            .map_err(|e| Error::SinkDelivery(format!("email request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(Error::SinkDelivery(format!(
                "email provider returned status {}",
                response.status()
            )));
        }
        info!(to, "email delivery succeeded");
        Ok(())
    }
}

#[async_trait]
impl SinkRouter for HttpSinkRouter {
    async fn deliver(&self, config: &ChannelConfig, subject: &str, body: &str) -> Result<()> {
        match config {
            ChannelConfig::ChatWebhook { url } => self.post_webhook(url, subject, body).await,
            ChannelConfig::Email { address } => self.post_email(address, subject, body).await,
        }
    }

    async fn deliver_email(&self, address: &str, subject: &str, body: &str) -> Result<()> {
        self.post_email(address, subject, body).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unconfigured_email_provider_is_a_delivery_error() {
        let router =
            HttpSinkRouter::new(SinkConfig::default(), Duration::from_millis(100)).unwrap();
        let err = router
            .deliver_email("someone@example.com", "subject", "body")
            .await
            .unwrap_err();
        assert_eq!(err.category(), "sink");
    }
}
