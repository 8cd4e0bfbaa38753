// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Telegram Bot API channel.

use std::time::Duration;

use async_trait::async_trait;
use sasso_core::backend::{BackendError, Result, TelegramSender, TelegramTarget};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Request timeout for Bot API calls.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Serialize)]
struct SendMessage<'a> {
    chat_id: &'a str,
    text: &'a str,
}

#[derive(Deserialize)]
struct ApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Posts messages through `sendMessage`.
#[derive(Debug, Clone)]
pub struct HttpTelegramSender {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTelegramSender {
    /// Create a sender for the Bot API at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BackendError::Other(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    fn send_message_url(&self, token: &str) -> String {
        format!("{}/bot{}/sendMessage", self.base_url, token)
    }
}

#[async_trait]
impl TelegramSender for HttpTelegramSender {
    async fn send(&self, target: &TelegramTarget, text: &str) -> Result<()> {
        let response = self
            .client
            .post(self.send_message_url(&target.token))
            .json(&SendMessage {
                chat_id: &target.chat_id,
                text,
            })
            .send()
            .await
            .map_err(|e| BackendError::Unreachable(format!("Telegram request failed: {}", e)))?;

        let status = response.status();
        // Error replies carry a description too, so parse before checking status
        let body: Option<ApiResponse> = response.json().await.ok();

        match body {
            Some(body) if status.is_success() && body.ok => {
                debug!(chat_id = %target.chat_id, "Telegram message sent");
                Ok(())
            }
            Some(body) => Err(BackendError::Rejected(format!(
                "Telegram returned {}: {}",
                status.as_u16(),
                body.description.unwrap_or_default()
            ))),
            None => Err(BackendError::Rejected(format!(
                "Telegram returned {} with an unreadable body",
                status.as_u16()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target() -> TelegramTarget {
        TelegramTarget {
            token: "123:abc".to_string(),
            chat_id: "42".to_string(),
        }
    }

    #[tokio::test]
    async fn test_send_message() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(serde_json::json!({"chat_id": "42", "text": "VM ready"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"ok": true, "result": {}})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let sender = HttpTelegramSender::new(mock_server.uri()).unwrap();
        sender.send(&target(), "VM ready").await.unwrap();
    }

    #[tokio::test]
    async fn test_api_error_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(403).set_body_json(serde_json::json!({
                "ok": false,
                "description": "Forbidden: bot was blocked by the user"
            })))
            .mount(&mock_server)
            .await;

        let sender = HttpTelegramSender::new(format!("{}/", mock_server.uri())).unwrap();
        let err = sender.send(&target(), "hello").await.unwrap_err();
        match err {
            BackendError::Rejected(msg) => {
                assert!(msg.contains("403"));
                assert!(msg.contains("blocked"));
            }
            other => panic!("expected Rejected, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_ok_false_is_rejected() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": false})),
            )
            .mount(&mock_server)
            .await;

        let sender = HttpTelegramSender::new(mock_server.uri()).unwrap();
        let err = sender.send(&target(), "hello").await.unwrap_err();
        assert!(matches!(err, BackendError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        // Nothing listens on port 9 of localhost
        let sender = HttpTelegramSender::new("http://127.0.0.1:9").unwrap();
        let err = sender.send(&target(), "hello").await.unwrap_err();
        assert!(err.is_retryable());
    }
}
