//! Notification Delivery
//!
//! The `notify` push callback the dispatcher invokes for every matched
//! transaction, the Markdown message rendering, and a Telegram Bot API
//! implementation that delivers to the subscriber's private chat.

use std::time::Duration;

use alloy::primitives::U256;
use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::matcher::{canonical_address, Direction, MatchedTransaction};
use crate::store::SubscriberId;

/// Telegram Bot API base URL
pub const TELEGRAM_API_URL: &str = "https://api.telegram.org";

/// Native token symbol shown in messages
pub const DEFAULT_SYMBOL: &str = "PHRS";

/// Block explorer base URL
pub const DEFAULT_EXPLORER_URL: &str = "https://pharos-testnet.socialscan.io";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Decimals of the chain's native token
const NATIVE_DECIMALS: u32 = 18;

/// Decimals shown in messages
const DISPLAY_DECIMALS: u32 = 6;

/// Errors that can occur while delivering a notification
#[derive(Error, Debug)]
pub enum NotifyError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Delivery rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },
}

/// Push callback invoked once per matched, not yet delivered transaction
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(
        &self,
        subscriber: SubscriberId,
        matched: &MatchedTransaction,
    ) -> Result<(), NotifyError>;
}

/// Format a base-unit amount in whole native units with six decimals,
/// rounding half up
///
/// # Example
/// 1.5 ether in wei renders as `"1.500000"`.
pub fn format_native_value(value: U256) -> String {
    let step = U256::from(10u64).pow(U256::from(NATIVE_DECIMALS - DISPLAY_DECIMALS));
    let scale = U256::from(10u64).pow(U256::from(DISPLAY_DECIMALS));

    let half = step / U256::from(2u64);
    let units = value.saturating_add(half) / step;

    format!("{}.{:0>6}", units / scale, (units % scale).to_string())
}

/// Escape the entities of Telegram's legacy Markdown so `text` renders
/// literally
pub fn escape_markdown(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        if matches!(c, '_' | '*' | '`' | '[') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Message rendering settings
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageFormat {
    /// Native token symbol, e.g. `PHRS`
    pub symbol: String,
    /// Explorer base URL without trailing slash
    pub explorer_url: String,
}

impl Default for MessageFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOL, DEFAULT_EXPLORER_URL)
    }
}

impl MessageFormat {
    pub fn new(symbol: impl Into<String>, explorer_url: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            explorer_url: explorer_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Explorer page of a transaction
    pub fn tx_link(&self, matched: &MatchedTransaction) -> String {
        format!("{}/tx/{:#x}", self.explorer_url, matched.hash)
    }

    /// Explorer page of an address
    pub fn address_link(&self, address: &alloy::primitives::Address) -> String {
        format!("{}/address/{}", self.explorer_url, canonical_address(address))
    }

    /// Render the Markdown notification text for a match
    pub fn render(&self, matched: &MatchedTransaction) -> String {
        let (marker, label) = match matched.direction {
            Direction::Outgoing => ("📤", "Outgoing"),
            Direction::Incoming => ("📥", "Incoming"),
        };
        let to = matched
            .to
            .map(|to| format!("`{}`", canonical_address(&to)))
            .unwrap_or_else(|| "contract creation".to_string());

        format!(
            "{marker} *{label} transaction detected!*\n\n\
             💰 *Amount:* {value} {symbol}\n\
             📤 *From:* `{from}`\n\
             📥 *To:* {to}\n\
             🧱 *Block:* {block}\n\
             ⛽ *Gas:* {gas}\n\n\
             🔗 [View on explorer]({link})",
            value = format_native_value(matched.value),
            symbol = escape_markdown(&self.symbol),
            from = canonical_address(&matched.from),
            block = matched.block_number,
            gas = matched.gas,
            link = self.tx_link(matched),
        )
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: SubscriberId,
    text: &'a str,
    parse_mode: &'static str,
    disable_web_page_preview: bool,
}

/// [`Notifier`] sending to the subscriber's private chat via the Telegram
/// Bot API. The subscriber id is the chat id.
pub struct TelegramNotifier {
    client: reqwest::Client,
    api_url: String,
    token: String,
    format: MessageFormat,
}

impl TelegramNotifier {
    /// Create a notifier against the public Telegram API
    pub fn new(token: impl Into<String>, format: MessageFormat) -> Result<Self, NotifyError> {
        Self::with_api_url(TELEGRAM_API_URL, token, format)
    }

    /// Create a notifier against a custom API base URL
    pub fn with_api_url(
        api_url: impl Into<String>,
        token: impl Into<String>,
        format: MessageFormat,
    ) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            format,
        })
    }

    pub fn format(&self) -> &MessageFormat {
        &self.format
    }

    /// Send a Markdown message to `chat_id`
    pub async fn send_message(&self, chat_id: SubscriberId, text: &str) -> Result<(), NotifyError> {
        let url = format!("{}/bot{}/sendMessage", self.api_url, self.token);
        let request = SendMessageRequest {
            chat_id,
            text,
            parse_mode: "Markdown",
            disable_web_page_preview: true,
        };

        let response = self.client.post(&url).json(&request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(NotifyError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        debug!(chat_id, "message sent");
        Ok(())
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn notify(
        &self,
        subscriber: SubscriberId,
        matched: &MatchedTransaction,
    ) -> Result<(), NotifyError> {
        let text = self.format.render(matched);
        self.send_message(subscriber, &text).await
    }
}
