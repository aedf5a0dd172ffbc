//! Messenger and Instagram direct messages. Both use the Graph API
//! `entry[].messaging[]` envelope and the same signing scheme.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::json;

use super::signature::{
    answer_hub_subscription, signing_secret, verify_prefixed_hex_sha1, verify_prefixed_hex_sha256,
};
use super::{api_base, from_unix_millis, media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v17.0";

#[derive(Debug, Clone)]
pub struct MetaMessagingAdapter {
    platform: Platform,
    settings: ChannelSettings,
}

impl MetaMessagingAdapter {
    /// `platform` must be `Messenger` or `Instagram`.
    pub fn new(platform: Platform, settings: ChannelSettings) -> Self {
        Self { platform, settings }
    }
}

impl ChannelAdapter for MetaMessagingAdapter {
    fn platform(&self) -> Platform {
        self.platform
    }

    /// Accepts either the SHA-256 or the legacy SHA-1 signature header.
    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        if let Some(signature) = header_str(headers, "x-hub-signature-256") {
            return verify_prefixed_hex_sha256(secret, raw_body, signature);
        }
        if let Some(signature) = header_str(headers, "x-hub-signature") {
            return verify_prefixed_hex_sha1(secret, raw_body, signature);
        }
        Err(AdapterError::Authentication("missing_signature"))
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let webhook: MetaWebhook =
            serde_json::from_slice(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;

        let mut events = Vec::new();
        for entry in webhook.entry {
            for event in entry.messaging {
                let (message_id, text, is_echo) = match (&event.message, &event.postback) {
                    (Some(message), _) => {
                        let Some(mid) = message.mid.clone() else {
                            continue;
                        };
                        (mid, message_text(message), message.is_echo)
                    }
                    (None, Some(postback)) => {
                        let mid = postback.mid.clone().unwrap_or_else(|| {
                            format!("postback:{}:{}", event.sender.id, event.timestamp)
                        });
                        let text = postback
                            .title
                            .clone()
                            .or_else(|| postback.payload.clone())
                            .unwrap_or_default();
                        (mid, text, false)
                    }
                    // Delivery and read receipts.
                    (None, None) => continue,
                };
                // The customer is the recipient of an echoed page message.
                let customer_id = if is_echo {
                    event.recipient.id.clone()
                } else {
                    event.sender.id.clone()
                };
                events.push(NormalizedEvent {
                    platform: self.platform,
                    external_conversation_id: customer_id,
                    external_message_id: message_id,
                    sender_id: event.sender.id.clone(),
                    sender_display_name: None,
                    text,
                    timestamp: from_unix_millis(event.timestamp),
                    metadata: json!({
                        "page_id": entry.id,
                        "recipient_id": event.recipient.id,
                    }),
                    is_echo,
                });
            }
        }
        Ok(events)
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let Some(token) = self.settings.access_token.as_deref() else {
            return SendOutcome::failed(format!("{} access token not configured", self.platform));
        };
        let url = format!(
            "{}/me/messages",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE)
        );
        let body = json!({
            "recipient": { "id": recipient_id },
            "messaging_type": "RESPONSE",
            "message": { "text": text },
        });
        post(
            &url,
            Auth::Bearer(token),
            Payload::Json(&body),
            self.settings.send_timeout(),
            |body| body.get("message_id")?.as_str().map(str::to_string),
        )
    }

    fn answer_challenge(&self, query: &HashMap<String, String>) -> Result<String, AdapterError> {
        answer_hub_subscription(query, self.settings.verify_token.as_deref())
    }

    fn own_account_id(&self) -> Option<&str> {
        self.settings.account_id.as_deref()
    }
}

fn message_text(message: &MetaMessage) -> String {
    if let Some(text) = message.text.as_ref().filter(|t| !t.is_empty()) {
        return text.clone();
    }
    match message.attachments.first() {
        Some(attachment) => media_placeholder(&attachment.attachment_type),
        None => String::new(),
    }
}

#[derive(Debug, Deserialize)]
struct MetaWebhook {
    #[serde(default)]
    entry: Vec<MetaEntry>,
}

#[derive(Debug, Deserialize)]
struct MetaEntry {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    messaging: Vec<MetaMessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MetaMessagingEvent {
    sender: MetaParty,
    recipient: MetaParty,
    #[serde(default)]
    timestamp: i64,
    #[serde(default)]
    message: Option<MetaMessage>,
    #[serde(default)]
    postback: Option<MetaPostback>,
}

#[derive(Debug, Deserialize)]
struct MetaParty {
    id: String,
}

#[derive(Debug, Deserialize)]
struct MetaMessage {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
    #[serde(default)]
    attachments: Vec<MetaAttachment>,
}

#[derive(Debug, Deserialize)]
struct MetaAttachment {
    #[serde(rename = "type")]
    attachment_type: String,
}

#[derive(Debug, Deserialize)]
struct MetaPostback {
    #[serde(default)]
    mid: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    payload: Option<String>,
}
