//! Notification channel configuration and types.

use crate::sender::NotifyError;
use cadence_core::events::Event;
use cadence_core::instance::{JobResult, JobState, StageResult, StageState};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub triggers: Vec<NotificationTrigger>,
    #[serde(default)]
    pub filter: Option<NotificationFilter>,
}

fn default_enabled() -> bool {
    true
}

impl NotificationChannel {
    pub fn new(name: impl Into<String>, webhook: WebhookConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            webhook,
            triggers: Vec::new(),
            filter: None,
        }
    }

    pub fn with_triggers(mut self, triggers: &[NotificationTrigger]) -> Self {
        self.triggers = triggers.to_vec();
        self
    }

    pub fn with_filter(mut self, filter: NotificationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Trigger to notify for, or `None` when this channel ignores the event.
    pub fn accepts(&self, event: &Event) -> Option<NotificationTrigger> {
        if !self.enabled {
            return None;
        }
        let trigger = NotificationTrigger::for_event(event)?;
        if !self.triggers.contains(&trigger) {
            return None;
        }
        match &self.filter {
            Some(filter) if !filter.matches(event) => None,
            _ => Some(trigger),
        }
    }
}

/// Load channel definitions from a YAML list.
pub fn load_channels(path: impl AsRef<Path>) -> Result<Vec<NotificationChannel>, NotifyError> {
    let content = std::fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

/// Generic webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub auth: Option<WebhookAuth>,
    pub retry_count: u32,
    pub retry_backoff_ms: u64,
    pub timeout_seconds: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HttpMethod {
    POST,
    PUT,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookAuth {
    pub auth_type: AuthType,
    pub token_secret: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthType {
    Bearer,
    Basic,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: HttpMethod::POST,
            headers: HashMap::new(),
            auth: None,
            retry_count: 3,
            retry_backoff_ms: 500,
            timeout_seconds: 30,
        }
    }
}

/// Events that can trigger a notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    PipelineScheduled,
    StageScheduled,
    StagePassed,
    StageFailed,
    StageCancelled,
    JobFailed,
    PipelineLocked,
    PipelineUnlocked,
}

impl NotificationTrigger {
    /// Classify an event. Intermediate stage and job transitions map to nothing.
    pub fn for_event(event: &Event) -> Option<Self> {
        match event {
            Event::PipelineScheduled(_) => Some(Self::PipelineScheduled),
            Event::PipelineLocked(_) => Some(Self::PipelineLocked),
            Event::PipelineUnlocked(_) => Some(Self::PipelineUnlocked),
            Event::StageStatusChanged(p) => match (p.state, p.result) {
                (StageState::Scheduled, _) => Some(Self::StageScheduled),
                (StageState::Completed, StageResult::Passed) => Some(Self::StagePassed),
                (StageState::Completed, StageResult::Failed) => Some(Self::StageFailed),
                (StageState::Completed, StageResult::Cancelled) => Some(Self::StageCancelled),
                _ => None,
            },
            Event::JobStatusChanged(p) => match (p.state, p.result) {
                (JobState::Completed, JobResult::Failed) => Some(Self::JobFailed),
                _ => None,
            },
        }
    }
}

/// Filters for notifications. Empty lists match everything.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationFilter {
    pub pipelines: Vec<String>,
    pub stages: Vec<String>,
}

impl NotificationFilter {
    pub fn matches(&self, event: &Event) -> bool {
        if !self.pipelines.is_empty() && !self.pipelines.iter().any(|p| p == event.pipeline_name()) {
            return false;
        }
        let stage = match event {
            Event::StageStatusChanged(p) => Some(&p.stage.stage_name),
            Event::JobStatusChanged(p) => Some(&p.stage.stage_name),
            _ => None,
        };
        match stage {
            Some(stage) if !self.stages.is_empty() => self.stages.contains(stage),
            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cadence_core::events::{PipelineLockPayload, StageStatusChangedPayload};
    use cadence_core::{StageIdentifier, StageInstanceId};
    use chrono::Utc;

    fn stage_event(stage: &str, state: StageState, result: StageResult) -> Event {
        Event::StageStatusChanged(StageStatusChangedPayload {
            stage_id: StageInstanceId::new(),
            stage: StageIdentifier {
                pipeline_name: "cruise".to_string(),
                pipeline_counter: 3,
                stage_name: stage.to_string(),
                stage_counter: 1,
            },
            state,
            result,
            approved_by: "changes".to_string(),
            timestamp: Utc::now(),
        })
    }

    #[test]
    fn test_trigger_classification() {
        assert_eq!(
            NotificationTrigger::for_event(&stage_event("dev", StageState::Completed, StageResult::Failed)),
            Some(NotificationTrigger::StageFailed)
        );
        assert_eq!(
            NotificationTrigger::for_event(&stage_event("dev", StageState::Scheduled, StageResult::Unknown)),
            Some(NotificationTrigger::StageScheduled)
        );
        assert_eq!(
            NotificationTrigger::for_event(&stage_event("dev", StageState::Building, StageResult::Unknown)),
            None
        );
    }

    #[test]
    fn test_channel_filters() {
        let channel = NotificationChannel::new("ops", WebhookConfig::default())
            .with_triggers(&[NotificationTrigger::StageFailed, NotificationTrigger::PipelineUnlocked])
            .with_filter(NotificationFilter {
                pipelines: vec!["cruise".to_string()],
                stages: vec!["ft".to_string()],
            });

        assert_eq!(
            channel.accepts(&stage_event("ft", StageState::Completed, StageResult::Failed)),
            Some(NotificationTrigger::StageFailed)
        );
        assert_eq!(channel.accepts(&stage_event("dev", StageState::Completed, StageResult::Failed)), None);
        assert_eq!(channel.accepts(&stage_event("ft", StageState::Completed, StageResult::Passed)), None);

        let unlocked = Event::PipelineUnlocked(PipelineLockPayload {
            pipeline_name: "cruise".to_string(),
            counter: 3,
            timestamp: Utc::now(),
        });
        assert_eq!(channel.accepts(&unlocked), Some(NotificationTrigger::PipelineUnlocked));

        let mut disabled = channel.clone();
        disabled.enabled = false;
        assert_eq!(disabled.accepts(&unlocked), None);
    }

    #[test]
    fn test_channel_yaml() {
        let yaml = r#"
- name: deploys
  webhook:
    url: https://hooks.example.com/cadence
    auth:
      auth_type: bearer
      token_secret: s3cret
  triggers: [stage_passed, stage_failed]
  filter:
    pipelines: [cruise]
"#;
        let channels: Vec<NotificationChannel> = serde_yaml::from_str(yaml).unwrap();
        let channel = &channels[0];
        assert!(channel.enabled);
        assert_eq!(channel.webhook.method, HttpMethod::POST);
        assert_eq!(channel.webhook.retry_count, 3);
        assert_eq!(channel.triggers.len(), 2);
        assert!(channel.filter.as_ref().is_some_and(|f| f.stages.is_empty()));
    }
}
