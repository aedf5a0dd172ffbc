//! Web live-chat widget sessions.

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;

use super::signature::{signing_secret, verify_prefixed_hex_sha256};
use super::{media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

#[derive(Debug, Clone)]
pub struct LiveChatAdapter {
    settings: ChannelSettings,
}

impl LiveChatAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

impl ChannelAdapter for LiveChatAdapter {
    fn platform(&self) -> Platform {
        Platform::LiveChat
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let signature = header_str(headers, "x-livechat-signature")
            .ok_or(AdapterError::Authentication("missing_signature"))?;
        verify_prefixed_hex_sha256(secret, raw_body, signature)
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let envelope: LiveChatEnvelope =
            serde_json::from_slice(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;
        if envelope.session_id.trim().is_empty() {
            return Err(AdapterError::Parse("missing session_id".to_string()));
        }
        let message = envelope.message;
        let text = match message.text.filter(|text| !text.trim().is_empty()) {
            Some(text) => text,
            None => media_placeholder(message.attachment_type.as_deref().unwrap_or("attachment")),
        };
        let is_echo = matches!(message.author.kind.as_str(), "agent" | "bot");

        Ok(vec![NormalizedEvent {
            platform: Platform::LiveChat,
            external_conversation_id: envelope.session_id.clone(),
            external_message_id: message.id,
            sender_id: message.author.id,
            sender_display_name: message.author.name,
            text,
            timestamp: envelope.created_at.unwrap_or_else(Utc::now),
            metadata: json!({
                "session_id": envelope.session_id,
                "author_type": message.author.kind,
                "page_url": envelope.page_url,
            }),
            is_echo,
        }])
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let Some(base) = self
            .settings
            .api_base_url
            .as_deref()
            .map(|base| base.trim_end_matches('/'))
            .filter(|base| !base.is_empty())
        else {
            return SendOutcome::failed("livechat api_base_url not configured");
        };
        let url = format!("{}/v1/sessions/{}/messages", base, recipient_id);
        let auth = match self.settings.access_token.as_deref() {
            Some(token) => Auth::Bearer(token),
            None => Auth::None,
        };
        post(
            &url,
            auth,
            Payload::Json(&json!({ "text": text, "author": { "type": "bot" } })),
            self.settings.send_timeout(),
            |body| body.get("id")?.as_str().map(str::to_string),
        )
    }
}

#[derive(Debug, Deserialize)]
struct LiveChatEnvelope {
    session_id: String,
    message: LiveChatMessage,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    page_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct LiveChatMessage {
    id: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachment_type: Option<String>,
    author: LiveChatAuthor,
}

#[derive(Debug, Deserialize)]
struct LiveChatAuthor {
    id: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(rename = "type", default = "default_author_type")]
    kind: String,
}

fn default_author_type() -> String {
    "visitor".to_string()
}
