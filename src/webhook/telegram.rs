use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::Serialize;
use serde_json::Value;
use teloxide::prelude::*;
use teloxide::types::{Chat, UpdateKind};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Telegram rejects messages longer than 4096 characters; leave headroom.
pub const MAX_MESSAGE_LEN: usize = 4000;

/// Fields extracted from an incoming Telegram message, stored as one document.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TelegramMessage {
    pub message_id: i32,
    pub chat_id: i64,
    pub chat_type: String,
    pub user_id: Option<u64>,
    pub username: Option<String>,
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub text: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message_type: String,
    /// The update exactly as Telegram delivered it.
    pub update: Value,
}

impl TelegramMessage {
    /// Extract the message record from a raw update.
    ///
    /// Returns `Ok(None)` for updates that carry no new message (edits,
    /// callback queries, member changes and so on).
    pub fn from_update(raw: &Value) -> Result<Option<Self>> {
        // teloxide's Update only deserializes reliably from text; going through
        // `from_value` turns well-formed messages into `UpdateKind::Error`.
        let update: Update = serde_json::from_str(&raw.to_string())
            .context("Payload is not a Telegram update")?;

        let msg = match update.kind {
            UpdateKind::Message(msg) => msg,
            other => {
                debug!("Ignoring update {} without a message: {:?}", update.id.0, other);
                return Ok(None);
            }
        };

        let user = msg.from.as_ref();
        let text = msg.text().map(str::to_string);

        Ok(Some(Self {
            message_id: msg.id.0,
            chat_id: msg.chat.id.0,
            chat_type: chat_type(&msg.chat).to_string(),
            user_id: user.map(|u| u.id.0),
            username: user.and_then(|u| u.username.clone()),
            first_name: user.map(|u| u.first_name.clone()),
            last_name: user.and_then(|u| u.last_name.clone()),
            message_type: if text.is_some() { "text" } else { "other" }.to_string(),
            text,
            timestamp: msg.date,
            update: raw.clone(),
        }))
    }

    /// `{chat_id}_{message_id}`; unique per message, stable across redelivery.
    pub fn document_id(&self) -> String {
        format!("{}_{}", self.chat_id, self.message_id)
    }

    pub fn is_private(&self) -> bool {
        self.chat_type == "private"
    }

    pub fn to_document(&self) -> Result<Value> {
        serde_json::to_value(self).context("Failed to serialize Telegram message")
    }
}

fn chat_type(chat: &Chat) -> &'static str {
    if chat.is_private() {
        "private"
    } else if chat.is_group() {
        "group"
    } else if chat.is_supergroup() {
        "supergroup"
    } else if chat.is_channel() {
        "channel"
    } else {
        "unknown"
    }
}

/// Sends text back to a Telegram chat.
#[async_trait]
pub trait ReplySender: Send + Sync {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()>;
}

/// Replies through the Bot API.
pub struct TelegramReplies {
    bot: Bot,
}

impl TelegramReplies {
    pub fn new(bot: Bot) -> Self {
        Self { bot }
    }
}

#[async_trait]
impl ReplySender for TelegramReplies {
    async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
        for chunk in split_message(text, MAX_MESSAGE_LEN) {
            self.bot
                .send_message(ChatId(chat_id), chunk)
                .await
                .with_context(|| format!("Failed to send message to chat {chat_id}"))?;
        }
        info!("Response sent to chat {}", chat_id);
        Ok(())
    }
}

/// Split long messages for Telegram's 4096 char limit
pub fn split_message(text: &str, max_len: usize) -> Vec<String> {
    if text.len() <= max_len {
        return vec![text.to_string()];
    }

    let mut chunks = Vec::new();
    let mut start = 0;

    while start < text.len() {
        let mut end = (start + max_len).min(text.len());
        // Walk back to a valid UTF-8 char boundary so slicing doesn't panic
        while end > start && !text.is_char_boundary(end) {
            end -= 1;
        }
        if end == start {
            // max_len is narrower than this character; emit it whole
            end = start + text[start..].chars().next().map_or(1, char::len_utf8);
        }
        let actual_end = if end < text.len() {
            text[start..end]
                .rfind('\n')
                .or_else(|| text[start..end].rfind(' '))
                .map(|pos| start + pos + 1)
                .unwrap_or(end)
        } else {
            end
        };

        chunks.push(text[start..actual_end].to_string());
        start = actual_end;
    }

    chunks
}

#[derive(Debug, Error, PartialEq)]
pub enum WebhookSetupError {
    #[error("Telegram bot token must look like '<bot id>:<secret>'")]
    MalformedToken,

    #[error("Invalid webhook URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Webhook URL must use https, got '{0}'")]
    InsecureUrl(String),
}

/// Check the shape of a bot token: a numeric bot id, a colon, and a secret.
pub fn validate_bot_token(token: &str) -> Result<(), WebhookSetupError> {
    let (id, secret) = token
        .trim()
        .split_once(':')
        .ok_or(WebhookSetupError::MalformedToken)?;
    let id_ok = !id.is_empty() && id.chars().all(|c| c.is_ascii_digit());
    let secret_ok = !secret.is_empty()
        && secret
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');
    if id_ok && secret_ok {
        Ok(())
    } else {
        Err(WebhookSetupError::MalformedToken)
    }
}

/// Telegram only delivers webhooks over HTTPS.
pub fn validate_webhook_url(raw: &str) -> Result<Url, WebhookSetupError> {
    let url = Url::parse(raw.trim()).map_err(|e| WebhookSetupError::InvalidUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    if url.scheme() != "https" {
        return Err(WebhookSetupError::InsecureUrl(raw.to_string()));
    }
    if url.host_str().is_none() {
        return Err(WebhookSetupError::InvalidUrl {
            url: raw.to_string(),
            reason: "missing host".to_string(),
        });
    }
    Ok(url)
}

pub async fn register_webhook(bot: &Bot, url: Url) -> Result<()> {
    info!("Registering webhook: {}", url);
    bot.set_webhook(url)
        .await
        .context("Failed to register webhook with Telegram")?;
    Ok(())
}

pub async fn remove_webhook(bot: &Bot) -> Result<()> {
    bot.delete_webhook()
        .await
        .context("Failed to remove webhook from Telegram")?;
    info!("Webhook removed");
    Ok(())
}

/// Best-effort reply; failures are logged, never propagated.
pub async fn reply(sender: Option<&dyn ReplySender>, chat_id: i64, text: &str) {
    let Some(sender) = sender else {
        debug!("No reply channel configured; dropping reply to chat {}", chat_id);
        return;
    };
    if let Err(e) = sender.send(chat_id, text).await {
        warn!("{:#}", e);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex;

    /// Records replies instead of calling the Bot API.
    #[derive(Default)]
    pub(crate) struct RecordingReplies {
        pub sent: Mutex<Vec<(i64, String)>>,
    }

    impl RecordingReplies {
        pub(crate) fn sent(&self) -> Vec<(i64, String)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReplySender for RecordingReplies {
        async fn send(&self, chat_id: i64, text: &str) -> Result<()> {
            self.sent.lock().unwrap().push((chat_id, text.to_string()));
            Ok(())
        }
    }

    pub(crate) fn private_update(text: &str) -> Value {
        json!({
            "update_id": 123456789,
            "message": {
                "message_id": 1,
                "from": {
                    "id": 123456,
                    "is_bot": false,
                    "first_name": "Test",
                    "last_name": "User",
                    "username": "testuser"
                },
                "chat": {
                    "id": 123456,
                    "first_name": "Test",
                    "last_name": "User",
                    "username": "testuser",
                    "type": "private"
                },
                "date": 1640995200,
                "text": text
            }
        })
    }

    pub(crate) fn group_update() -> Value {
        json!({
            "update_id": 5,
            "message": {
                "message_id": 77,
                "from": {"id": 42, "is_bot": false, "first_name": "Ann"},
                "chat": {"id": -100200, "title": "Team", "type": "group"},
                "date": 1640995300,
                "text": "hello team"
            }
        })
    }

    #[test]
    fn test_extract_private_text_message() {
        let raw = private_update("Hello, this is a test message!");
        let record = TelegramMessage::from_update(&raw).unwrap().unwrap();

        assert_eq!(record.message_id, 1);
        assert_eq!(record.chat_id, 123456);
        assert_eq!(record.chat_type, "private");
        assert_eq!(record.user_id, Some(123456));
        assert_eq!(record.username.as_deref(), Some("testuser"));
        assert_eq!(record.first_name.as_deref(), Some("Test"));
        assert_eq!(record.last_name.as_deref(), Some("User"));
        assert_eq!(record.text.as_deref(), Some("Hello, this is a test message!"));
        assert_eq!(record.message_type, "text");
        assert_eq!(record.timestamp.timestamp(), 1640995200);
        assert_eq!(record.document_id(), "123456_1");
        assert!(record.is_private());

        let doc = record.to_document().unwrap();
        assert_eq!(doc["update"], raw);
        assert_eq!(doc["chat_type"], "private");
        assert_eq!(doc["timestamp"], "2022-01-01T00:00:00Z");
    }

    #[test]
    fn test_extract_from_delivered_body() {
        // Body as Telegram sends it, parsed the way the HTTP extractor does.
        let body = r#"{"update_id":42,"message":{"message_id":8,"from":{"id":7,"is_bot":false,"first_name":"Bo"},"chat":{"id":7,"first_name":"Bo","type":"private"},"date":1640995200,"text":"hi there"}}"#;
        let raw: Value = serde_json::from_str(body).unwrap();
        let record = TelegramMessage::from_update(&raw).unwrap().unwrap();
        assert_eq!(record.document_id(), "7_8");
        assert_eq!(record.text.as_deref(), Some("hi there"));
        assert_eq!(record.user_id, Some(7));
    }

    #[test]
    fn test_extract_group_message() {
        let record = TelegramMessage::from_update(&group_update()).unwrap().unwrap();
        assert_eq!(record.chat_type, "group");
        assert_eq!(record.document_id(), "-100200_77");
        assert!(!record.is_private());
        assert_eq!(record.last_name, None);
    }

    #[test]
    fn test_non_text_message_type() {
        let raw = json!({
            "update_id": 9,
            "message": {
                "message_id": 3,
                "from": {"id": 1, "is_bot": false, "first_name": "A"},
                "chat": {"id": 1, "first_name": "A", "type": "private"},
                "date": 1640995200,
                "location": {"latitude": 52.52, "longitude": 13.405}
            }
        });
        let record = TelegramMessage::from_update(&raw).unwrap().unwrap();
        assert_eq!(record.message_type, "other");
        assert_eq!(record.text, None);
    }

    #[test]
    fn test_update_without_message_is_skipped() {
        let raw = json!({
            "update_id": 10,
            "callback_query": {
                "id": "1",
                "from": {"id": 1, "is_bot": false, "first_name": "A"},
                "chat_instance": "x",
                "data": "press"
            }
        });
        assert!(TelegramMessage::from_update(&raw).unwrap().is_none());
    }

    #[test]
    fn test_split_message_short() {
        assert_eq!(split_message("hello", 4000), vec!["hello".to_string()]);
    }

    #[test]
    fn test_split_message_prefers_line_breaks() {
        let text = format!("{}\n{}", "a".repeat(30), "b".repeat(30));
        let chunks = split_message(&text, 40);
        assert_eq!(chunks.len(), 2);
        assert_eq!(chunks[0], format!("{}\n", "a".repeat(30)));
        assert_eq!(chunks[1], "b".repeat(30));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_message_multibyte_boundary() {
        let text = "é".repeat(50);
        let chunks = split_message(&text, 15);
        assert!(chunks.iter().all(|c| c.len() <= 15));
        assert_eq!(chunks.concat(), text);
    }

    #[test]
    fn test_split_message_narrower_than_char() {
        let chunks = split_message("日本", 2);
        assert_eq!(chunks, vec!["日".to_string(), "本".to_string()]);
    }

    #[test]
    fn test_validate_bot_token() {
        assert_eq!(validate_bot_token("123456:ABC-def_ghi"), Ok(()));
        assert_eq!(
            validate_bot_token("test_token"),
            Err(WebhookSetupError::MalformedToken)
        );
        assert_eq!(
            validate_bot_token("abc:def"),
            Err(WebhookSetupError::MalformedToken)
        );
        assert_eq!(
            validate_bot_token("123456:"),
            Err(WebhookSetupError::MalformedToken)
        );
    }

    #[test]
    fn test_validate_webhook_url() {
        let url = validate_webhook_url("https://bot.example.com/webhook").unwrap();
        assert_eq!(url.path(), "/webhook");

        assert_eq!(
            validate_webhook_url("http://bot.example.com/webhook"),
            Err(WebhookSetupError::InsecureUrl(
                "http://bot.example.com/webhook".to_string()
            ))
        );
        assert!(matches!(
            validate_webhook_url("not a url"),
            Err(WebhookSetupError::InvalidUrl { .. })
        ));
    }

    #[tokio::test]
    async fn test_reply_without_sender_is_noop() {
        reply(None, 1, "hi").await;

        let recorder = RecordingReplies::default();
        reply(Some(&recorder), 7, "hi").await;
        assert_eq!(recorder.sent(), vec![(7, "hi".to_string())]);
    }
}
