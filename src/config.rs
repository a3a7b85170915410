//! Configuration management for tblocker.

use anyhow::{Context, Result};
use ipnet::IpNet;
use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use crate::error::TblockerError;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/tblocker/config.yaml";

pub const DEFAULT_USERNAME_REGEX: &str = "^(.+)$";

/// Upper bound for `block_duration`: one year, in minutes.
pub const MAX_BLOCK_DURATION_MINUTES: u64 = 366 * 24 * 60;

/// Used when `webhook.template` is empty.
pub const DEFAULT_WEBHOOK_TEMPLATE: &str = r#"{"username":"{username}","ip":"{ip}","server":"{server}","action":"{action}","duration":{duration},"timestamp":"{timestamp}"}"#;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Proxy access log to watch
    pub log_file: PathBuf,

    /// Minutes an address stays blocked; also the reconciliation period
    pub block_duration: u64,

    /// Routing tag marking a violating line, without brackets
    pub torrent_tag: String,

    /// First capture group becomes the username sent in notifications
    pub username_regex: String,

    /// Firewall backend name (iptables, nft)
    pub block_mode: String,

    /// Addresses or networks that are never blocked
    pub bypass_ips: Vec<String>,

    /// Directory holding the blocked-address file and the lock file
    pub storage_dir: PathBuf,

    /// Period of the expired-entry safety sweep
    pub sweep_interval_secs: u64,

    pub webhook: WebhookConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_file: PathBuf::from("/var/log/remnanode/access.log"),
            block_duration: 10,
            torrent_tag: "TORRENT".to_string(),
            username_regex: DEFAULT_USERNAME_REGEX.to_string(),
            block_mode: "iptables".to_string(),
            bypass_ips: Vec::new(),
            storage_dir: PathBuf::from("/opt/tblocker"),
            sweep_interval_secs: 300,
            webhook: WebhookConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from YAML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;
        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path.as_ref()))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.block_duration == 0 {
            return Err(TblockerError::Config(
                "block_duration must be at least 1 minute".to_string(),
            )
            .into());
        }

        if self.block_duration > MAX_BLOCK_DURATION_MINUTES {
            return Err(TblockerError::Config(format!(
                "block_duration must be at most {} minutes, got {}",
                MAX_BLOCK_DURATION_MINUTES, self.block_duration
            ))
            .into());
        }

        if self.torrent_tag.trim().is_empty() {
            return Err(TblockerError::Config("torrent_tag must not be empty".to_string()).into());
        }

        if self.sweep_interval_secs == 0 {
            return Err(TblockerError::Config(
                "sweep_interval_secs must be greater than zero".to_string(),
            )
            .into());
        }

        self.compiled_username_regex()?;
        self.bypass_networks()?;

        if self.webhook.enabled
            && !(self.webhook.url.starts_with("https://") || self.webhook.url.starts_with("http://"))
        {
            return Err(TblockerError::Config(format!(
                "Webhook URL must use http or https: '{}'",
                self.webhook.url
            ))
            .into());
        }

        Ok(())
    }

    /// Compile `username_regex`, using the default when empty.
    pub fn compiled_username_regex(&self) -> Result<Regex> {
        let pattern = if self.username_regex.is_empty() {
            DEFAULT_USERNAME_REGEX
        } else {
            &self.username_regex
        };
        Regex::new(pattern).map_err(|e| {
            TblockerError::Config(format!("Invalid username_regex '{}': {}", pattern, e)).into()
        })
    }

    /// Parse `bypass_ips`; single addresses become host networks.
    pub fn bypass_networks(&self) -> Result<Vec<IpNet>> {
        self.bypass_ips
            .iter()
            .map(|entry| parse_bypass_entry(entry))
            .collect()
    }

    pub fn store_path(&self) -> PathBuf {
        self.storage_dir.join(crate::store::STORE_FILE)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.storage_dir.join(crate::lock::LOCK_FILE)
    }
}

fn parse_bypass_entry(entry: &str) -> Result<IpNet> {
    let entry = entry.trim();
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net.trunc());
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| TblockerError::Config(format!("Invalid bypass_ips entry '{}'", entry)).into())
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url: String,
    /// JSON body with `{username}` `{ip}` `{server}` `{action}` `{duration}`
    /// `{timestamp}` placeholders
    pub template: String,
    #[serde(deserialize_with = "deserialize_headers")]
    pub headers: HashMap<String, String>,
}

impl WebhookConfig {
    pub fn effective_template(&self) -> &str {
        if self.template.trim().is_empty() {
            DEFAULT_WEBHOOK_TEMPLATE
        } else {
            &self.template
        }
    }
}

/// Deserialize and validate HTTP headers (reject injection attempts)
fn deserialize_headers<'de, D>(deserializer: D) -> Result<HashMap<String, String>, D::Error>
where
    D: Deserializer<'de>,
{
    let headers: HashMap<String, String> = HashMap::deserialize(deserializer)?;

    for (key, value) in &headers {
        if key.contains('\r') || key.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains newline characters",
                key
            )));
        }
        if value.contains('\r') || value.contains('\n') {
            return Err(serde::de::Error::custom(format!(
                "Invalid header value for '{}': contains newline characters",
                key
            )));
        }
        // RFC 7230 token characters
        if key.is_empty()
            || !key
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || "!#$%&'*+-.^_`|~".contains(c))
        {
            return Err(serde::de::Error::custom(format!(
                "Invalid header name '{}': contains invalid characters",
                key
            )));
        }
    }

    Ok(headers)
}
