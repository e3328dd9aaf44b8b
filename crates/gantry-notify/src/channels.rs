//! Notification channel configuration and types.

use gantry_core::Glob;
use gantry_core::trigger::EventSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Notification channel configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationChannel {
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub config: ChannelConfig,
    #[serde(default = "default_triggers")]
    pub triggers: Vec<NotificationTrigger>,
    #[serde(default)]
    pub filter: Option<NotificationFilter>,
}

fn default_true() -> bool {
    true
}

fn default_triggers() -> Vec<NotificationTrigger> {
    vec![NotificationTrigger::RunFailed, NotificationTrigger::RunCanceled]
}

impl NotificationChannel {
    pub fn new(name: impl Into<String>, config: ChannelConfig) -> Self {
        Self {
            name: name.into(),
            enabled: true,
            config,
            triggers: default_triggers(),
            filter: None,
        }
    }

    pub fn with_triggers(mut self, triggers: Vec<NotificationTrigger>) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn with_filter(mut self, filter: NotificationFilter) -> Self {
        self.filter = Some(filter);
        self
    }

    /// Whether this channel wants `trigger` for a run on `ref_name`.
    pub fn wants(&self, trigger: NotificationTrigger, ref_name: &str, source: EventSource) -> bool {
        self.enabled
            && self.triggers.contains(&trigger)
            && self
                .filter
                .as_ref()
                .is_none_or(|f| f.matches(ref_name, source))
    }
}

/// Channel-specific configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChannelConfig {
    Slack(SlackConfig),
    Webhook(WebhookConfig),
    /// Write notifications to the log only.
    Log,
}

/// Slack incoming-webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlackConfig {
    pub webhook_url: String,
    #[serde(default)]
    pub channel: Option<String>,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_icon")]
    pub icon_emoji: String,
}

fn default_username() -> String {
    "Gantry".to_string()
}

fn default_icon() -> String {
    ":construction:".to_string()
}

impl Default for SlackConfig {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            channel: None,
            username: default_username(),
            icon_emoji: default_icon(),
        }
    }
}

/// Generic webhook configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    pub method: HttpMethod,
    pub headers: HashMap<String, String>,
    pub auth: Option<WebhookAuth>,
    /// Extra delivery attempts after a failed one.
    pub retry_count: u32,
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
    pub token: String,
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
            retry_count: 2,
            timeout_seconds: 30,
        }
    }
}

/// Notification trigger events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationTrigger {
    RunSucceeded,
    RunFailed,
    RunCanceled,
    ApprovalRequested,
}

/// Narrows a channel to some refs and trigger sources.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotificationFilter {
    /// Ref globs, e.g. `main` or `release/*`. Empty matches every ref.
    #[serde(default)]
    pub branches: Vec<String>,
    /// Empty matches every source.
    #[serde(default)]
    pub sources: Vec<EventSource>,
}

impl NotificationFilter {
    pub fn matches(&self, ref_name: &str, source: EventSource) -> bool {
        let branch_match = self.branches.is_empty()
            || self
                .branches
                .iter()
                .any(|b| Glob::new(b).is_ok_and(|g| g.is_match(ref_name)));
        let source_match = self.sources.is_empty() || self.sources.contains(&source);
        branch_match && source_match
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_branch_globs() {
        let filter = NotificationFilter {
            branches: vec!["main".to_string(), "release/*".to_string()],
            sources: vec![],
        };
        assert!(filter.matches("main", EventSource::Push));
        assert!(filter.matches("release/1.2", EventSource::Push));
        assert!(!filter.matches("feature/x", EventSource::Push));
    }

    #[test]
    fn test_channel_wants_configured_triggers() {
        let channel = NotificationChannel::new("ops", ChannelConfig::Log).with_filter(
            NotificationFilter {
                branches: vec![],
                sources: vec![EventSource::Schedule],
            },
        );
        assert!(channel.wants(NotificationTrigger::RunFailed, "main", EventSource::Schedule));
        assert!(!channel.wants(NotificationTrigger::RunFailed, "main", EventSource::Push));
        assert!(!channel.wants(NotificationTrigger::RunSucceeded, "main", EventSource::Schedule));
    }

    #[test]
    fn test_channel_from_yaml() {
        let yaml = r#"
name: team
config:
  type: slack
  webhook_url: https://hooks.slack.com/services/T/B/X
triggers: [run_failed, approval_requested]
"#;
        let channel: NotificationChannel = serde_yaml::from_str(yaml).unwrap();
        assert!(channel.enabled);
        assert!(matches!(channel.config, ChannelConfig::Slack(ref c) if c.username == "Gantry"));
        assert_eq!(channel.triggers.len(), 2);
    }
}
