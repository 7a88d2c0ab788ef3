//! Notification channels for Cadence.
//!
//! Turns committed scheduling events into notification payloads and
//! delivers them through webhook or in-process senders.

pub mod channels;
pub mod listener;
pub mod sender;

pub use channels::{
    AuthType, HttpMethod, NotificationChannel, NotificationFilter, NotificationTrigger,
    WebhookAuth, WebhookConfig, load_channels,
};
pub use listener::NotificationListener;
pub use sender::{
    NotificationPayload, NotificationSender, NotifyError, RecordingSender, WebhookSender,
};
