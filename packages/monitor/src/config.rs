//! Configuration
//!
//! Monitor loop timing and the environment-driven application settings.

use std::time::Duration;

use thiserror::Error;

use crate::notifier::{DEFAULT_EXPLORER_URL, DEFAULT_SYMBOL};
use crate::store::redis::DEFAULT_PREFIX;

/// Sleep between registry checks while no address is registered
pub const IDLE_INTERVAL_SECS: u64 = 10;

/// Sleep after catching up with the chain head
pub const POLL_INTERVAL_SECS: u64 = 5;

/// Sleep after a chain or store error
pub const BACKOFF_INTERVAL_SECS: u64 = 10;

/// Maximum number of blocks processed per batch
pub const BATCH_CAP: u64 = 10;

/// Pharos testnet JSON-RPC endpoint
pub const DEFAULT_RPC_URL: &str = "https://testnet.dplabs-internal.com/";

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Errors that can occur while loading configuration
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Timing and batching of the monitor loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorConfig {
    pub idle_interval: Duration,
    pub poll_interval: Duration,
    pub backoff_interval: Duration,
    /// Maximum blocks per batch, at least 1
    pub batch_cap: u64,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            idle_interval: Duration::from_secs(IDLE_INTERVAL_SECS),
            poll_interval: Duration::from_secs(POLL_INTERVAL_SECS),
            backoff_interval: Duration::from_secs(BACKOFF_INTERVAL_SECS),
            batch_cap: BATCH_CAP,
        }
    }
}

impl MonitorConfig {
    /// Set every interval to `interval`, handy for tests
    pub fn with_uniform_interval(interval: Duration) -> Self {
        Self {
            idle_interval: interval,
            poll_interval: interval,
            backoff_interval: interval,
            ..Default::default()
        }
    }

    pub fn with_idle_interval(mut self, interval: Duration) -> Self {
        self.idle_interval = interval;
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff_interval(mut self, interval: Duration) -> Self {
        self.backoff_interval = interval;
        self
    }

    pub fn with_batch_cap(mut self, batch_cap: u64) -> Self {
        self.batch_cap = batch_cap.max(1);
        self
    }

    /// Inclusive height range of the next batch after `cursor`, or `None`
    /// when the cursor is at or past `latest`
    pub fn next_batch(&self, cursor: u64, latest: u64) -> Option<(u64, u64)> {
        if latest <= cursor {
            return None;
        }
        let start = cursor + 1;
        let end = latest.min(cursor.saturating_add(self.batch_cap.max(1)));
        Some((start, end))
    }
}

/// Process-level settings read from the environment
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bot_token: String,
    /// Community group for the membership gate; none admits everyone
    pub group_chat_id: Option<String>,
    pub rpc_url: String,
    pub redis_url: String,
    pub redis_prefix: String,
    pub explorer_url: String,
    pub token_symbol: String,
    pub log_json: bool,
    pub monitor: MonitorConfig,
}

impl AppConfig {
    /// Load from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let bot_token = get("BOT_TOKEN").ok_or_else(|| ConfigError::MissingEnv("BOT_TOKEN".to_string()))?;

        let mut monitor = MonitorConfig::default();
        if let Some(secs) = parse_u64(&get, "POLL_INTERVAL_SECS")? {
            monitor.poll_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "IDLE_INTERVAL_SECS")? {
            monitor.idle_interval = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_u64(&get, "BACKOFF_INTERVAL_SECS")? {
            monitor.backoff_interval = Duration::from_secs(secs);
        }
        if let Some(cap) = parse_u64(&get, "BATCH_CAP")? {
            if cap == 0 {
                return Err(ConfigError::Invalid {
                    key: "BATCH_CAP".to_string(),
                    reason: "must be at least 1".to_string(),
                });
            }
            monitor.batch_cap = cap;
        }

        let log_json = match get("LOG_JSON").as_deref() {
            None => false,
            Some("1") | Some("true") | Some("yes") => true,
            Some("0") | Some("false") | Some("no") => false,
            Some(other) => {
                return Err(ConfigError::Invalid {
                    key: "LOG_JSON".to_string(),
                    reason: format!("expected a boolean, got {:?}", other),
                })
            }
        };

        let explorer_url = match get("EXPLORER_URL") {
            Some(url) => validate_explorer_url(url)?,
            None => DEFAULT_EXPLORER_URL.to_string(),
        };

        Ok(Self {
            bot_token,
            group_chat_id: get("GROUP_CHAT_ID"),
            rpc_url: get("RPC_URL").unwrap_or_else(|| DEFAULT_RPC_URL.to_string()),
            redis_url: get("REDIS_URL").unwrap_or_else(|| DEFAULT_REDIS_URL.to_string()),
            redis_prefix: get("REDIS_PREFIX").unwrap_or_else(|| DEFAULT_PREFIX.to_string()),
            explorer_url,
            token_symbol: get("TOKEN_SYMBOL").unwrap_or_else(|| DEFAULT_SYMBOL.to_string()),
            log_json,
            monitor,
        })
    }
}

/// The explorer URL ends up inside a Markdown link, where these characters
/// break parsing
const EXPLORER_URL_FORBIDDEN: &[char] = &['_', '*', '`', '[', ']', '(', ')'];

fn validate_explorer_url(url: String) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::Invalid {
        key: "EXPLORER_URL".to_string(),
        reason,
    };

    if !(url.starts_with("http://") || url.starts_with("https://")) {
        return Err(invalid(format!("{:?} is not an http(s) URL", url)));
    }
    if let Some(c) = url
        .chars()
        .find(|c| c.is_whitespace() || EXPLORER_URL_FORBIDDEN.contains(c))
    {
        return Err(invalid(format!("{:?} contains {:?}", url, c)));
    }
    Ok(url)
}

fn parse_u64<G>(get: &G, key: &str) -> Result<Option<u64>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .map(|raw| {
            raw.parse::<u64>().map_err(|e| ConfigError::Invalid {
                key: key.to_string(),
                reason: format!("{:?}: {}", raw, e),
            })
        })
        .transpose()
}
