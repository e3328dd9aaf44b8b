//! Pipeline status notifications for Gantry.
//!
//! Delivers run outcomes and approval requests to Slack, generic webhooks,
//! or the log.

pub mod channels;
pub mod sender;

pub use channels::{
    AuthType, ChannelConfig, HttpMethod, NotificationChannel, NotificationFilter,
    NotificationTrigger, SlackConfig, WebhookAuth, WebhookConfig,
};
pub use sender::{
    Delivery, LogSender, NotificationPayload, NotificationSender, Notifier, NotifyError,
    SlackSender, WebhookSender, create_sender, pending_approvals,
};
