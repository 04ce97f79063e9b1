//! Membership Gate
//!
//! Boolean oracle consulted before a registration is admitted: is the
//! subscriber currently a member of the required community group?

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use tracing::debug;

use crate::notifier::TELEGRAM_API_URL;
use crate::store::SubscriberId;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Chat member statuses that count as membership
pub const MEMBER_STATUSES: [&str; 4] = ["member", "administrator", "creator", "restricted"];

/// Errors that can occur during a gate check
#[derive(Error, Debug)]
pub enum GateError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Gate API error: {0}")]
    Api(String),
}

/// Eligibility oracle for registration
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipGate: Send + Sync {
    async fn is_eligible(&self, subscriber: SubscriberId) -> Result<bool, GateError>;
}

/// Gate that admits everyone, used when no group is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenGate;

#[async_trait]
impl MembershipGate for OpenGate {
    async fn is_eligible(&self, _subscriber: SubscriberId) -> Result<bool, GateError> {
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatMember {
    status: String,
}

/// Gate backed by Telegram `getChatMember` on the community group
pub struct TelegramGroupGate {
    client: reqwest::Client,
    api_url: String,
    token: String,
    group_chat_id: String,
}

impl TelegramGroupGate {
    pub fn new(token: impl Into<String>, group_chat_id: impl Into<String>) -> Result<Self, GateError> {
        Self::with_api_url(TELEGRAM_API_URL, token, group_chat_id)
    }

    pub fn with_api_url(
        api_url: impl Into<String>,
        token: impl Into<String>,
        group_chat_id: impl Into<String>,
    ) -> Result<Self, GateError> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            api_url: api_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
            group_chat_id: group_chat_id.into(),
        })
    }

    /// Raw membership status of `subscriber` in the group
    pub async fn member_status(&self, subscriber: SubscriberId) -> Result<String, GateError> {
        let url = format!(
            "{}/bot{}/getChatMember?chat_id={}&user_id={}",
            self.api_url, self.token, self.group_chat_id, subscriber
        );

        let response: ApiResponse<ChatMember> = self.client.get(&url).send().await?.json().await?;

        match response {
            ApiResponse {
                ok: true,
                result: Some(member),
                ..
            } => Ok(member.status),
            ApiResponse { description, .. } => Err(GateError::Api(
                description.unwrap_or_else(|| "getChatMember returned no result".to_string()),
            )),
        }
    }
}

#[async_trait]
impl MembershipGate for TelegramGroupGate {
    async fn is_eligible(&self, subscriber: SubscriberId) -> Result<bool, GateError> {
        let status = self.member_status(subscriber).await?;
        debug!(subscriber, status = %status, "group membership checked");
        Ok(MEMBER_STATUSES.contains(&status.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn gate_with_reply(status: usize, body: &str) -> (mockito::ServerGuard, TelegramGroupGate) {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/bottest-token/getChatMember")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("chat_id".into(), "-100123".into()),
                mockito::Matcher::UrlEncoded("user_id".into(), "42".into()),
            ]))
            .with_status(status)
            .with_body(body)
            .create_async()
            .await;

        let gate = TelegramGroupGate::with_api_url(server.url(), "test-token", "-100123").unwrap();
        (server, gate)
    }

    #[tokio::test]
    async fn test_open_gate_admits_everyone() {
        assert!(OpenGate.is_eligible(1).await.unwrap());
    }

    #[tokio::test]
    async fn test_member_statuses_are_eligible() {
        for status in MEMBER_STATUSES {
            let body = format!(r#"{{"ok":true,"result":{{"status":"{}"}}}}"#, status);
            let (_server, gate) = gate_with_reply(200, &body).await;
            assert!(gate.is_eligible(42).await.unwrap(), "{} should be eligible", status);
        }
    }

    #[tokio::test]
    async fn test_left_and_kicked_are_not_eligible() {
        for status in ["left", "kicked"] {
            let body = format!(r#"{{"ok":true,"result":{{"status":"{}"}}}}"#, status);
            let (_server, gate) = gate_with_reply(200, &body).await;
            assert!(!gate.is_eligible(42).await.unwrap());
        }
    }

    #[tokio::test]
    async fn test_api_error_is_surfaced() {
        let (_server, gate) = gate_with_reply(
            400,
            r#"{"ok":false,"error_code":400,"description":"Bad Request: user not found"}"#,
        )
        .await;

        match gate.is_eligible(42).await {
            Err(GateError::Api(description)) => assert!(description.contains("user not found")),
            other => panic!("expected API error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_api() {
        let gate = TelegramGroupGate::with_api_url("http://127.0.0.1:1", "t", "-1").unwrap();
        assert!(matches!(gate.is_eligible(42).await, Err(GateError::Http(_))));
    }
}
