//! Event listener that forwards committed events to a notification channel.

use crate::channels::NotificationChannel;
use crate::sender::{NotificationPayload, NotificationSender, WebhookSender};
use async_trait::async_trait;
use cadence_core::events::Event;
use cadence_core::ports::EventListener;
use std::sync::Arc;
use tracing::debug;

pub struct NotificationListener {
    channel: NotificationChannel,
    sender: Arc<dyn NotificationSender>,
}

impl NotificationListener {
    pub fn new(channel: NotificationChannel, sender: Arc<dyn NotificationSender>) -> Self {
        Self { channel, sender }
    }

    /// Listener delivering through the channel's own webhook.
    pub fn webhook(channel: NotificationChannel) -> Self {
        let sender = Arc::new(WebhookSender::new(channel.webhook.clone()));
        Self::new(channel, sender)
    }

    pub fn channel(&self) -> &NotificationChannel {
        &self.channel
    }
}

#[async_trait]
impl EventListener for NotificationListener {
    fn name(&self) -> &str {
        &self.channel.name
    }

    async fn on_event(&self, event: &Event) -> cadence_core::Result<()> {
        let Some(trigger) = self.channel.accepts(event) else {
            return Ok(());
        };
        debug!(channel = %self.channel.name, subject = %event.subject(), ?trigger, "Notifying");
        let payload = NotificationPayload::from_event(trigger, event);
        self.sender.send(&payload).await?;
        Ok(())
    }
}
