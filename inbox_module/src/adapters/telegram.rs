//! Telegram Bot API updates.

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use super::signature::{constant_time_eq, signing_secret};
use super::{api_base, from_unix_seconds, media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://api.telegram.org";

#[derive(Debug, Clone)]
pub struct TelegramAdapter {
    settings: ChannelSettings,
}

impl TelegramAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

impl ChannelAdapter for TelegramAdapter {
    fn platform(&self) -> Platform {
        Platform::Telegram
    }

    /// Telegram echoes the `secret_token` given to `setWebhook` in a header.
    fn verify(&self, headers: &HeaderMap, _raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let provided = header_str(headers, "x-telegram-bot-api-secret-token")
            .ok_or(AdapterError::Authentication("missing_token"))?;
        if !constant_time_eq(provided.as_bytes(), secret.as_bytes()) {
            return Err(AdapterError::Authentication("invalid_token"));
        }
        Ok(())
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let update: TelegramUpdate =
            serde_json::from_slice(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;
        let Some(message) = update
            .message
            .or(update.edited_message)
            .or(update.channel_post)
        else {
            return Ok(Vec::new());
        };

        let chat_id = message.chat.id.to_string();
        let (sender_id, display_name, is_bot) = match &message.from {
            Some(user) => (user.id.to_string(), Some(user.display_name()), user.is_bot),
            None => (chat_id.clone(), message.chat.title.clone(), false),
        };
        let is_echo = is_bot && self.settings.account_id.as_deref() == Some(sender_id.as_str());

        Ok(vec![NormalizedEvent {
            platform: Platform::Telegram,
            external_message_id: format!("{}:{}", chat_id, message.message_id),
            external_conversation_id: chat_id,
            sender_id,
            sender_display_name: display_name,
            text: message_text(&message),
            timestamp: from_unix_seconds(message.date),
            metadata: json!({
                "update_id": update.update_id,
                "chat_type": message.chat.chat_type,
            }),
            is_echo,
        }])
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let Some(token) = self.settings.access_token.as_deref() else {
            return SendOutcome::failed("telegram bot token not configured");
        };
        let url = format!(
            "{}/bot{}/sendMessage",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE),
            token
        );
        post(
            &url,
            Auth::None,
            Payload::Json(&json!({ "chat_id": recipient_id, "text": text })),
            self.settings.send_timeout(),
            |body| {
                let chat = body.pointer("/result/chat/id")?.as_i64()?;
                let id = body.pointer("/result/message_id")?.as_i64()?;
                Some(format!("{}:{}", chat, id))
            },
        )
    }

    fn own_account_id(&self) -> Option<&str> {
        self.settings.account_id.as_deref()
    }
}

fn message_text(message: &TelegramMessage) -> String {
    if let Some(text) = message.text.as_ref().or(message.caption.as_ref()) {
        return text.clone();
    }
    let kind = if message.photo.is_some() {
        "photo"
    } else if message.voice.is_some() {
        "voice"
    } else if message.document.is_some() {
        "document"
    } else if message.sticker.is_some() {
        "sticker"
    } else if message.location.is_some() {
        "location"
    } else {
        "unsupported"
    };
    media_placeholder(kind)
}

#[derive(Debug, Deserialize)]
struct TelegramUpdate {
    update_id: i64,
    #[serde(default)]
    message: Option<TelegramMessage>,
    #[serde(default)]
    edited_message: Option<TelegramMessage>,
    #[serde(default)]
    channel_post: Option<TelegramMessage>,
}

#[derive(Debug, Deserialize)]
struct TelegramMessage {
    message_id: i64,
    #[serde(default)]
    from: Option<TelegramUser>,
    chat: TelegramChat,
    date: i64,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    caption: Option<String>,
    #[serde(default)]
    photo: Option<serde_json::Value>,
    #[serde(default)]
    voice: Option<serde_json::Value>,
    #[serde(default)]
    document: Option<serde_json::Value>,
    #[serde(default)]
    sticker: Option<serde_json::Value>,
    #[serde(default)]
    location: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct TelegramUser {
    id: i64,
    #[serde(default)]
    is_bot: bool,
    first_name: String,
    #[serde(default)]
    last_name: Option<String>,
}

impl TelegramUser {
    fn display_name(&self) -> String {
        match &self.last_name {
            Some(last) => format!("{} {}", self.first_name, last),
            None => self.first_name.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TelegramChat {
    id: i64,
    #[serde(rename = "type", default)]
    chat_type: String,
    #[serde(default)]
    title: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    const UPDATE: &str = r#"{
        "update_id": 10000,
        "message": {
            "message_id": 1365,
            "date": 1714564800,
            "chat": {"id": 1111111, "type": "private", "first_name": "Test"},
            "from": {"id": 1111111, "is_bot": false, "first_name": "Test", "last_name": "Lastname"},
            "text": "/start"
        }
    }"#;

    fn adapter() -> TelegramAdapter {
        TelegramAdapter::new(ChannelSettings {
            secret: Some("webhook-secret".to_string()),
            access_token: Some("123:ABC".to_string()),
            account_id: Some("999".to_string()),
            ..Default::default()
        })
    }

    #[test]
    fn message_id_is_scoped_to_chat() {
        let events = adapter().parse(UPDATE.as_bytes()).expect("parse");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].external_message_id, "1111111:1365");
        assert_eq!(events[0].external_conversation_id, "1111111");
        assert_eq!(events[0].sender_display_name.as_deref(), Some("Test Lastname"));
        assert!(!events[0].is_echo);
    }

    #[test]
    fn updates_without_messages_are_skipped() {
        let payload = r#"{"update_id": 1, "callback_query": {"id": "x"}}"#;
        assert!(adapter().parse(payload.as_bytes()).expect("parse").is_empty());
    }

    #[test]
    fn secret_token_header_is_compared() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-telegram-bot-api-secret-token",
            HeaderValue::from_static("webhook-secret"),
        );
        assert!(adapter().verify(&headers, b"{}").is_ok());
        headers.insert(
            "x-telegram-bot-api-secret-token",
            HeaderValue::from_static("guess"),
        );
        assert_eq!(
            adapter().verify(&headers, b"{}"),
            Err(AdapterError::Authentication("invalid_token"))
        );
    }

    #[test]
    fn sends_via_bot_api() {
        let mut server = mockito::Server::new();
        let mock = server
            .mock("POST", "/bot123:ABC/sendMessage")
            .with_status(200)
            .with_body(r#"{"ok":true,"result":{"message_id":1366,"chat":{"id":1111111}}}"#)
            .create();
        let adapter = TelegramAdapter::new(ChannelSettings {
            api_base_url: Some(server.url()),
            ..adapter().settings
        });
        let outcome = adapter.send("1111111", "Welcome!");
        mock.assert();
        assert_eq!(outcome.external_id.as_deref(), Some("1111111:1366"));
    }
}
