//! Notification sender implementation.

use crate::channels::*;
use async_trait::async_trait;
use cadence_core::events::Event;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Invalid channel configuration: {0}")]
    Config(#[from] serde_yaml::Error),
    #[error("Failed to read channel configuration: {0}")]
    Io(#[from] std::io::Error),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

impl From<NotifyError> for cadence_core::Error {
    fn from(err: NotifyError) -> Self {
        match err {
            NotifyError::Serialization(e) => cadence_core::Error::Serialization(e.to_string()),
            other => cadence_core::Error::Internal(other.to_string()),
        }
    }
}

/// Notification payload for sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub message: String,
    pub trigger: Option<NotificationTrigger>,
    pub subject: Option<String>,
    pub pipeline_name: Option<String>,
    pub pipeline_counter: Option<u32>,
    pub stage_name: Option<String>,
    pub status: Option<String>,
    pub event: Option<Event>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl NotificationPayload {
    pub fn new(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            trigger: None,
            subject: None,
            pipeline_name: None,
            pipeline_counter: None,
            stage_name: None,
            status: None,
            event: None,
            timestamp: chrono::Utc::now(),
        }
    }

    /// Describe a committed event for humans and attach the event itself.
    pub fn from_event(trigger: NotificationTrigger, event: &Event) -> Self {
        let (title, message, counter, stage, status) = match event {
            Event::PipelineScheduled(p) => (
                format!("Pipeline {} scheduled", p.pipeline),
                format!("{} (label {})", p.trigger_message, p.pipeline.label),
                Some(p.pipeline.counter),
                None,
                None,
            ),
            Event::PipelineLocked(p) => (
                format!("Pipeline {} locked", p.pipeline_name),
                format!("Locked by instance {}", p.counter),
                Some(p.counter),
                None,
                None,
            ),
            Event::PipelineUnlocked(p) => (
                format!("Pipeline {} unlocked", p.pipeline_name),
                format!("Released by instance {}", p.counter),
                Some(p.counter),
                None,
                None,
            ),
            Event::StageStatusChanged(p) => (
                format!("Stage {} {}", p.stage, p.result.to_string().to_lowercase()),
                format!("Stage {} is {:?}, approved by {}", p.stage, p.state, p.approved_by),
                Some(p.stage.pipeline_counter),
                Some(p.stage.stage_name.clone()),
                Some(p.result.to_string().to_lowercase()),
            ),
            Event::JobStatusChanged(p) => (
                format!("Job {}/{} {}", p.stage, p.job_name, p.result.to_string().to_lowercase()),
                format!("Job {} in stage {} is {}", p.job_name, p.stage, p.state),
                Some(p.stage.pipeline_counter),
                Some(p.stage.stage_name.clone()),
                Some(p.result.to_string().to_lowercase()),
            ),
        };

        let mut payload = Self::new(title, message);
        payload.trigger = Some(trigger);
        payload.subject = Some(event.subject());
        payload.pipeline_name = Some(event.pipeline_name().to_string());
        payload.pipeline_counter = counter;
        payload.stage_name = stage;
        payload.status = status;
        payload.event = Some(event.clone());
        payload
    }
}

/// Trait for notification senders.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Generic webhook sender.
pub struct WebhookSender {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookSender {
    pub fn new(config: WebhookConfig) -> Self {
        let timeout = config.timeout_seconds;
        Self {
            config,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(timeout as u64))
                .build()
                .unwrap_or_default(),
        }
    }

    async fn attempt(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let mut request = match self.config.method {
            HttpMethod::POST => self.client.post(&self.config.url),
            HttpMethod::PUT => self.client.put(&self.config.url),
        };

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        if let Some(ref auth) = self.config.auth {
            request = match auth.auth_type {
                AuthType::Bearer => request.bearer_auth(&auth.token_secret),
                AuthType::Basic => request.basic_auth(&auth.token_secret, None::<&str>),
            };
        }

        let response = request.json(payload).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::DeliveryFailed(format!(
                "Webhook returned {}: {}",
                status, body
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl NotificationSender for WebhookSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        debug!(url = %self.config.url, title = %payload.title, "Sending webhook notification");

        let mut attempt = 0;
        loop {
            match self.attempt(payload).await {
                Ok(()) => {
                    info!(url = %self.config.url, "Webhook notification sent successfully");
                    return Ok(());
                }
                Err(e) if attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!(url = %self.config.url, attempt, error = %e, "Webhook delivery failed, retrying");
                    tokio::time::sleep(Duration::from_millis(self.config.retry_backoff_ms * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Keeps every payload in memory. Used by tests and the CLI.
#[derive(Default, Clone)]
pub struct RecordingSender {
    sent: Arc<Mutex<Vec<NotificationPayload>>>,
}

impl RecordingSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn sent(&self) -> Vec<NotificationPayload> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSender for RecordingSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        self.sent.lock().await.push(payload.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(server: &MockServer, retry_count: u32) -> WebhookConfig {
        WebhookConfig {
            url: format!("{}/hooks/cadence", server.uri()),
            retry_count,
            retry_backoff_ms: 0,
            timeout_seconds: 5,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_webhook_delivers_with_auth_and_headers() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hooks/cadence"))
            .and(header("authorization", "Bearer s3cret"))
            .and(header("x-cadence-channel", "deploys"))
            .and(body_partial_json(serde_json::json!({"title": "Pipeline cruise/4 scheduled"})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config(&server, 0);
        config.headers.insert("x-cadence-channel".to_string(), "deploys".to_string());
        config.auth = Some(WebhookAuth {
            auth_type: AuthType::Bearer,
            token_secret: "s3cret".to_string(),
        });

        let sender = WebhookSender::new(config);
        sender
            .send(&NotificationPayload::new("Pipeline cruise/4 scheduled", "modified by alice"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_retries_then_fails() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("busy"))
            .expect(3)
            .mount(&server)
            .await;

        let sender = WebhookSender::new(config(&server, 2));
        let err = sender
            .send(&NotificationPayload::new("title", "message"))
            .await
            .unwrap_err();

        assert!(matches!(err, NotifyError::DeliveryFailed(_)));
        assert!(err.to_string().contains("503"));
        assert!(matches!(cadence_core::Error::from(err), cadence_core::Error::Internal(_)));
    }

    #[tokio::test]
    async fn test_webhook_put() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = config(&server, 0);
        config.method = HttpMethod::PUT;
        WebhookSender::new(config)
            .send(&NotificationPayload::new("title", "message"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recording_sender() {
        let sender = RecordingSender::new();
        sender.send(&NotificationPayload::new("a", "b")).await.unwrap();
        let sent = sender.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].title, "a");
    }
}
