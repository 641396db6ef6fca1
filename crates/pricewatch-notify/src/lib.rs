//! Operator notification sinks.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

pub const CRATE_NAME: &str = "pricewatch-notify";

pub const DEFAULT_TELEGRAM_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessageOptions {
    /// Render the text as HTML markup.
    pub rich_text: bool,
}

impl MessageOptions {
    pub fn plain() -> Self {
        Self { rich_text: false }
    }

    pub fn rich() -> Self {
        Self { rich_text: true }
    }
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("notifier request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("notifier rejected message (http {status}): {description}")]
    Rejected { status: u16, description: String },
}

/// At-least-once message sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, text: &str, options: MessageOptions) -> Result<(), NotifyError>;
}

/// Writes messages to the log instead of delivering them.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, text: &str, options: MessageOptions) -> Result<(), NotifyError> {
        info!(rich_text = options.rich_text, message = text, "notification");
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct TelegramConfig {
    pub api_base: String,
    pub bot_token: String,
    pub chat_id: String,
    pub timeout: Duration,
}

impl TelegramConfig {
    pub fn new(bot_token: impl Into<String>, chat_id: impl Into<String>) -> Self {
        Self {
            api_base: DEFAULT_TELEGRAM_API_BASE.to_string(),
            bot_token: bot_token.into(),
            chat_id: chat_id.into(),
            timeout: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Serialize)]
struct SendMessageRequest<'a> {
    chat_id: &'a str,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
}

#[derive(Debug, Deserialize)]
struct BotApiResponse {
    ok: bool,
    #[serde(default)]
    description: Option<String>,
}

/// Delivers messages to one chat through the Telegram Bot API `sendMessage` method.
#[derive(Debug, Clone)]
pub struct TelegramNotifier {
    client: reqwest::Client,
    endpoint: String,
    chat_id: String,
}

impl TelegramNotifier {
    pub fn new(config: TelegramConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .context("building telegram client")?;
        let endpoint = format!(
            "{}/bot{}/sendMessage",
            config.api_base.trim_end_matches('/'),
            config.bot_token
        );
        Ok(Self {
            client,
            endpoint,
            chat_id: config.chat_id,
        })
    }
}

#[async_trait]
impl Notifier for TelegramNotifier {
    async fn send_message(&self, text: &str, options: MessageOptions) -> Result<(), NotifyError> {
        let request = SendMessageRequest {
            chat_id: &self.chat_id,
            text,
            parse_mode: options.rich_text.then_some("HTML"),
        };
        let resp = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = resp.status();
        let body: Option<BotApiResponse> = resp.json().await.ok();

        match body {
            Some(body) if status.is_success() && body.ok => Ok(()),
            Some(body) => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: body.description.unwrap_or_else(|| "no description".to_string()),
            }),
            None => Err(NotifyError::Rejected {
                status: status.as_u16(),
                description: "unreadable response body".to_string(),
            }),
        }
    }
}

/// Escape text for Telegram's HTML parse mode.
pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            _ => out.push(c),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn notifier(server: &MockServer) -> TelegramNotifier {
        TelegramNotifier::new(TelegramConfig {
            api_base: server.uri(),
            ..TelegramConfig::new("123:abc", "415611078")
        })
        .expect("notifier")
    }

    #[tokio::test]
    async fn rich_message_is_sent_with_html_parse_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(json!({
                "chat_id": "415611078",
                "text": "<b>hi</b>",
                "parse_mode": "HTML"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": {}})))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server)
            .send_message("<b>hi</b>", MessageOptions::rich())
            .await
            .expect("sent");
    }

    #[tokio::test]
    async fn plain_message_omits_parse_mode() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/bot123:abc/sendMessage"))
            .and(body_json(json!({"chat_id": "415611078", "text": "done"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        notifier(&server)
            .send_message("done", MessageOptions::plain())
            .await
            .expect("sent");
    }

    #[tokio::test]
    async fn api_rejection_carries_description() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(json!({
                "ok": false,
                "error_code": 400,
                "description": "Bad Request: chat not found"
            })))
            .mount(&server)
            .await;

        let err = notifier(&server)
            .send_message("done", MessageOptions::plain())
            .await
            .unwrap_err();
        match err {
            NotifyError::Rejected { status, description } => {
                assert_eq!(status, 400);
                assert_eq!(description, "Bad Request: chat not found");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn html_escaping_covers_markup_characters() {
        assert_eq!(
            escape_html("a<b>&'c\""),
            "a&lt;b&gt;&amp;&#39;c&quot;"
        );
        assert_eq!(escape_html("https://example.com/p?x=1"), "https://example.com/p?x=1");
    }
}
