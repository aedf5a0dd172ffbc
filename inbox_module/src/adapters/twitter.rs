//! Twitter / X direct messages via the Account Activity webhook.

use std::collections::HashMap;

use axum::http::HeaderMap;
use base64::Engine;
use serde::Deserialize;
use serde_json::json;

use super::signature::{hmac_sha256, signing_secret, verify_base64_sha256};
use super::{api_base, from_unix_millis, media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://api.twitter.com";

#[derive(Debug, Clone)]
pub struct TwitterAdapter {
    settings: ChannelSettings,
}

impl TwitterAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

impl ChannelAdapter for TwitterAdapter {
    fn platform(&self) -> Platform {
        Platform::Twitter
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let signature = header_str(headers, "x-twitter-webhooks-signature")
            .ok_or(AdapterError::Authentication("missing_signature"))?;
        let encoded = signature
            .strip_prefix("sha256=")
            .ok_or(AdapterError::Authentication("malformed_signature"))?;
        verify_base64_sha256(secret, raw_body, encoded)
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let envelope: TwitterEnvelope =
            serde_json::from_slice(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;
        let own_id = envelope
            .for_user_id
            .clone()
            .or_else(|| self.settings.account_id.clone());

        let mut events = Vec::new();
        for event in envelope.direct_message_events {
            if event.event_type != "message_create" {
                continue;
            }
            let Some(create) = event.message_create else {
                continue;
            };
            let is_echo = own_id.as_deref() == Some(create.sender_id.as_str());
            let customer_id = if is_echo {
                create.target.recipient_id.clone()
            } else {
                create.sender_id.clone()
            };
            let text = match (create.message_data.text.trim(), &create.message_data.attachment) {
                ("", Some(attachment)) => media_placeholder(&attachment.attachment_type),
                (text, _) => text.to_string(),
            };
            let display_name = envelope
                .users
                .get(&create.sender_id)
                .map(|user| user.name.clone());
            let timestamp = event
                .created_timestamp
                .parse::<i64>()
                .map(from_unix_millis)
                .unwrap_or_else(|_| chrono::Utc::now());
            events.push(NormalizedEvent {
                platform: Platform::Twitter,
                external_conversation_id: customer_id,
                external_message_id: event.id,
                sender_id: create.sender_id,
                sender_display_name: display_name,
                text,
                timestamp,
                metadata: json!({ "for_user_id": envelope.for_user_id }),
                is_echo,
            });
        }
        Ok(events)
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let Some(token) = self.settings.access_token.as_deref() else {
            return SendOutcome::failed("twitter access token not configured");
        };
        let url = format!(
            "{}/2/dm_conversations/with/{}/messages",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE),
            recipient_id
        );
        post(
            &url,
            Auth::Bearer(token),
            Payload::Json(&json!({ "text": text })),
            self.settings.send_timeout(),
            |body| body.pointer("/data/dm_event_id")?.as_str().map(str::to_string),
        )
    }

    /// CRC check: `sha256=<base64 HMAC-SHA256(consumer_secret, crc_token)>`.
    fn answer_challenge(&self, query: &HashMap<String, String>) -> Result<String, AdapterError> {
        let crc_token = query
            .get("crc_token")
            .filter(|token| !token.is_empty())
            .ok_or(AdapterError::Challenge("missing_crc_token"))?;
        let secret = self
            .settings
            .secret()
            .ok_or(AdapterError::Challenge("secret_not_configured"))?;
        let digest = hmac_sha256(secret, crc_token.as_bytes())?;
        Ok(format!(
            "sha256={}",
            base64::engine::general_purpose::STANDARD.encode(digest)
        ))
    }

    fn own_account_id(&self) -> Option<&str> {
        self.settings.account_id.as_deref()
    }
}

#[derive(Debug, Deserialize)]
struct TwitterEnvelope {
    #[serde(default)]
    for_user_id: Option<String>,
    #[serde(default)]
    direct_message_events: Vec<TwitterDmEvent>,
    #[serde(default)]
    users: HashMap<String, TwitterUser>,
}

#[derive(Debug, Deserialize)]
struct TwitterDmEvent {
    #[serde(rename = "type")]
    event_type: String,
    id: String,
    #[serde(default)]
    created_timestamp: String,
    #[serde(default)]
    message_create: Option<TwitterMessageCreate>,
}

#[derive(Debug, Deserialize)]
struct TwitterMessageCreate {
    target: TwitterTarget,
    sender_id: String,
    message_data: TwitterMessageData,
}

#[derive(Debug, Deserialize)]
struct TwitterTarget {
    recipient_id: String,
}

#[derive(Debug, Deserialize)]
struct TwitterMessageData {
    #[serde(default)]
    text: String,
    #[serde(default)]
    attachment: Option<TwitterAttachment>,
}

#[derive(Debug, Deserialize)]
struct TwitterAttachment {
    #[serde(rename = "type")]
    attachment_type: String,
}

#[derive(Debug, Deserialize)]
struct TwitterUser {
    name: String,
}
