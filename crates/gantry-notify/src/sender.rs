//! Notification sender implementation.

use crate::channels::*;
use async_trait::async_trait;
use gantry_core::ids::{InstanceKey, RunId};
use gantry_core::run::{JobStatus, PipelineStatus};
use gantry_core::trigger::EventSource;
use gantry_scheduler::ExecutionReport;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("Channel not configured: {0}")]
    NotConfigured(String),
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Notification payload for sending.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub trigger: NotificationTrigger,
    pub title: String,
    pub message: String,
    pub run_id: RunId,
    pub ref_name: String,
    pub source: EventSource,
    #[serde(default)]
    pub status: Option<PipelineStatus>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
    /// Required jobs that failed.
    #[serde(default)]
    pub failed_jobs: Vec<String>,
    #[serde(default)]
    pub job: Option<InstanceKey>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl NotificationPayload {
    /// Terminal status of a run.
    pub fn from_report(report: &ExecutionReport) -> Self {
        let trigger = match report.status {
            PipelineStatus::Failed => NotificationTrigger::RunFailed,
            PipelineStatus::Canceled => NotificationTrigger::RunCanceled,
            _ => NotificationTrigger::RunSucceeded,
        };
        let failed_jobs: Vec<String> = report
            .jobs
            .iter()
            .filter(|j| j.is_required_failure())
            .map(|j| j.key.to_string())
            .collect();
        let counts = report.counts();

        let mut message = format!(
            "{} succeeded, {} failed, {} canceled, {} skipped",
            counts.succeeded, counts.failed, counts.canceled, counts.skipped
        );
        if !failed_jobs.is_empty() {
            message.push_str(&format!(". Failed: {}", failed_jobs.join(", ")));
        }

        Self {
            trigger,
            title: format!("Pipeline {} on {}", report.status, report.ref_name),
            message,
            run_id: report.run_id,
            ref_name: report.ref_name.clone(),
            source: report.source,
            status: Some(report.status),
            duration_ms: Some(report.duration_ms),
            failed_jobs,
            job: None,
            timestamp: report.finished_at,
        }
    }

    /// A manual job is waiting for approval.
    pub fn approval_requested(
        run_id: RunId,
        key: InstanceKey,
        ref_name: impl Into<String>,
        source: EventSource,
    ) -> Self {
        let ref_name = ref_name.into();
        Self {
            trigger: NotificationTrigger::ApprovalRequested,
            title: format!("Approval needed for {}", key),
            message: format!("Manual job {} on {} is waiting for approval", key, ref_name),
            run_id,
            ref_name,
            source,
            status: None,
            duration_ms: None,
            failed_jobs: Vec::new(),
            job: Some(key),
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Trait for notification senders.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError>;
}

/// Slack notification sender.
pub struct SlackSender {
    config: SlackConfig,
    client: reqwest::Client,
}

impl SlackSender {
    pub fn new(config: SlackConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    fn build_message(&self, payload: &NotificationPayload) -> serde_json::Value {
        let color = match payload.status {
            Some(PipelineStatus::Succeeded) => "#36a64f",
            Some(PipelineStatus::Failed) => "#dc3545",
            Some(PipelineStatus::Canceled) => "#6c757d",
            _ => "#0366d6",
        };

        let mut fields = vec![
            serde_json::json!({"title": "Ref", "value": payload.ref_name, "short": true}),
            serde_json::json!({"title": "Source", "value": payload.source.as_str(), "short": true}),
        ];
        if let Some(ms) = payload.duration_ms {
            fields.push(serde_json::json!({"title": "Duration", "value": format!("{:.1}s", ms as f64 / 1000.0), "short": true}));
        }

        let mut message = serde_json::json!({
            "username": self.config.username,
            "icon_emoji": self.config.icon_emoji,
            "attachments": [{
                "color": color,
                "title": payload.title,
                "text": payload.message,
                "fields": fields,
                "footer": payload.run_id.to_string(),
                "ts": payload.timestamp.timestamp()
            }]
        });
        if let Some(channel) = &self.config.channel {
            message["channel"] = serde_json::json!(channel);
        }
        message
    }
}

#[async_trait]
impl NotificationSender for SlackSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        if self.config.webhook_url.is_empty() {
            return Err(NotifyError::NotConfigured("slack webhook_url".to_string()));
        }
        debug!(run_id = %payload.run_id, "Sending Slack notification");

        let message = self.build_message(payload);
        let response = self
            .client
            .post(&self.config.webhook_url)
            .json(&message)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::DeliveryFailed(format!(
                "Slack returned {}: {}",
                status, body
            )));
        }

        info!(run_id = %payload.run_id, "Slack notification sent successfully");
        Ok(())
    }
}

/// Generic webhook sender. Posts the payload as JSON.
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

    async fn deliver(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        let mut request = match self.config.method {
            HttpMethod::POST => self.client.post(&self.config.url),
            HttpMethod::PUT => self.client.put(&self.config.url),
        };

        for (key, value) in &self.config.headers {
            request = request.header(key, value);
        }

        if let Some(ref auth) = self.config.auth {
            request = match auth.auth_type {
                AuthType::Bearer => request.bearer_auth(&auth.token),
                AuthType::Basic => request.basic_auth(&auth.token, None::<&str>),
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
        if self.config.url.is_empty() {
            return Err(NotifyError::NotConfigured("webhook url".to_string()));
        }
        debug!(url = %self.config.url, run_id = %payload.run_id, "Sending webhook notification");

        let mut attempt = 0;
        loop {
            match self.deliver(payload).await {
                Ok(()) => {
                    info!(url = %self.config.url, "Webhook notification sent successfully");
                    return Ok(());
                }
                Err(e) if attempt < self.config.retry_count => {
                    attempt += 1;
                    warn!(url = %self.config.url, error = %e, attempt, "Webhook delivery failed, retrying");
                    tokio::time::sleep(Duration::from_millis(200 * attempt as u64)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Writes notifications to the log.
pub struct LogSender;

#[async_trait]
impl NotificationSender for LogSender {
    async fn send(&self, payload: &NotificationPayload) -> Result<(), NotifyError> {
        info!(
            run_id = %payload.run_id,
            trigger = ?payload.trigger,
            ref_name = %payload.ref_name,
            title = %payload.title,
            message = %payload.message,
            "Notification"
        );
        Ok(())
    }
}

/// Create a sender for a channel configuration.
pub fn create_sender(config: &ChannelConfig) -> Box<dyn NotificationSender> {
    match config {
        ChannelConfig::Slack(c) => Box::new(SlackSender::new(c.clone())),
        ChannelConfig::Webhook(c) => Box::new(WebhookSender::new(c.clone())),
        ChannelConfig::Log => Box::new(LogSender),
    }
}

/// Delivery result for one channel.
#[derive(Debug)]
pub struct Delivery {
    pub channel: String,
    pub result: Result<(), NotifyError>,
}

/// Fans payloads out to every interested channel.
pub struct Notifier {
    channels: Vec<(NotificationChannel, Box<dyn NotificationSender>)>,
}

impl Notifier {
    pub fn new(channels: Vec<NotificationChannel>) -> Self {
        let channels = channels
            .into_iter()
            .map(|channel| {
                let sender = create_sender(&channel.config);
                (channel, sender)
            })
            .collect();
        Self { channels }
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Send to every channel subscribed to the payload's trigger. Delivery
    /// failures are returned, never raised.
    pub async fn notify(&self, payload: &NotificationPayload) -> Vec<Delivery> {
        let mut deliveries = Vec::new();
        for (channel, sender) in &self.channels {
            if !channel.wants(payload.trigger, &payload.ref_name, payload.source) {
                continue;
            }
            let result = sender.send(payload).await;
            if let Err(e) = &result {
                warn!(channel = %channel.name, error = %e, "Notification delivery failed");
            }
            deliveries.push(Delivery {
                channel: channel.name.clone(),
                result,
            });
        }
        deliveries
    }

    pub async fn notify_report(&self, report: &ExecutionReport) -> Vec<Delivery> {
        self.notify(&NotificationPayload::from_report(report)).await
    }
}

/// Manual jobs still waiting when a report was produced.
pub fn pending_approvals(report: &ExecutionReport) -> Vec<InstanceKey> {
    report
        .jobs
        .iter()
        .filter(|j| j.status == JobStatus::ManualPending)
        .map(|j| j.key.clone())
        .collect()
}
