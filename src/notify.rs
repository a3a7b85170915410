//! Block/unblock notifications (webhook).

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::WebhookConfig;

/// Timeout for webhook HTTP requests (30s for slow networks)
const TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Block,
    Unblock,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Block => "block",
            Action::Unblock => "unblock",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub username: String,
    pub address: String,
    pub action: Action,
    pub duration_minutes: u64,
    pub timestamp: DateTime<Utc>,
}

/// Receives every completed block and unblock.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> Result<()>;
}

/// Used when no webhook is configured.
pub struct NoopNotifier;

#[async_trait]
impl Notifier for NoopNotifier {
    async fn notify(&self, _notification: &Notification) -> Result<()> {
        Ok(())
    }
}

/// POSTs a rendered JSON template to a fixed URL.
pub struct WebhookNotifier {
    client: Client,
    url: String,
    template: String,
    headers: HashMap<String, String>,
    username_regex: Regex,
    placeholder: Regex,
    server: String,
}

impl WebhookNotifier {
    pub fn new(config: &WebhookConfig, username_regex: Regex, server: String) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(TIMEOUT_SECS))
            .build()
            .context("Failed to create HTTP client for webhook")?;
        let placeholder = Regex::new(r"\{(username|ip|server|action|duration|timestamp)\}")
            .context("Failed to compile placeholder pattern")?;

        Ok(Self {
            client,
            url: config.url.clone(),
            template: config.effective_template().to_string(),
            headers: config.headers.clone(),
            username_regex,
            placeholder,
            server,
        })
    }

    /// Fill the template placeholders in one pass. String values are
    /// JSON-escaped.
    pub fn render(&self, notification: &Notification) -> String {
        let username = clean_username(&self.username_regex, &notification.username);
        self.placeholder
            .replace_all(&self.template, |caps: &regex::Captures| match &caps[1] {
                "username" => json_escape(&username),
                "ip" => json_escape(&notification.address),
                "server" => json_escape(&self.server),
                "action" => notification.action.as_str().to_string(),
                "duration" => notification.duration_minutes.to_string(),
                _ => notification.timestamp.to_rfc3339(),
            })
            .into_owned()
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &Notification) -> Result<()> {
        let body = self.render(notification);

        let mut request = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(body);

        // Validated during config deserialization
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }

        let response = request.send().await.context("Failed to send webhook")?;

        if !response.status().is_success() {
            warn!("Webhook returned non-success status: {}", response.status());
        } else {
            debug!(
                "Webhook sent: {} {}",
                notification.action, notification.address
            );
        }
        Ok(())
    }
}

/// First capture group of `re`, or the raw value when it does not match.
pub fn clean_username(re: &Regex, raw: &str) -> String {
    re.captures(raw)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().to_string())
        .unwrap_or_else(|| raw.to_string())
}

/// Escape for embedding inside a JSON string literal.
fn json_escape(value: &str) -> String {
    let quoted = serde_json::Value::String(value.to_string()).to_string();
    quoted[1..quoted.len() - 1].to_string()
}

/// Host name reported in notifications.
pub fn hostname() -> String {
    std::fs::read_to_string("/proc/sys/kernel/hostname")
        .ok()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_else(|| "unknown".to_string())
}
