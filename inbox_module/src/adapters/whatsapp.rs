//! WhatsApp via the Meta Cloud API.

use std::collections::HashMap;

use axum::http::HeaderMap;
use serde::Deserialize;
use serde_json::{json, Value};

use super::signature::{answer_hub_subscription, signing_secret, verify_prefixed_hex_sha256};
use super::{api_base, from_unix_seconds, media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://graph.facebook.com/v17.0";

#[derive(Debug, Clone)]
pub struct WhatsAppAdapter {
    settings: ChannelSettings,
}

impl WhatsAppAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }

    fn messages_url(&self) -> Option<String> {
        let phone_number_id = self.settings.account_id.as_deref()?;
        Some(format!(
            "{}/{}/messages",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE),
            phone_number_id
        ))
    }
}

impl ChannelAdapter for WhatsAppAdapter {
    fn platform(&self) -> Platform {
        Platform::WhatsApp
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let signature = header_str(headers, "x-hub-signature-256")
            .ok_or(AdapterError::Authentication("missing_signature"))?;
        verify_prefixed_hex_sha256(secret, raw_body, signature)
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let webhook: WhatsAppWebhook =
            serde_json::from_slice(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;

        let mut events = Vec::new();
        for entry in webhook.entry {
            for change in entry.changes {
                let value = change.value;
                let names: HashMap<String, String> = value
                    .contacts
                    .iter()
                    .filter_map(|contact| {
                        let name = contact.profile.as_ref()?.name.clone();
                        Some((contact.wa_id.clone(), name))
                    })
                    .collect();
                let business_number = value
                    .metadata
                    .as_ref()
                    .and_then(|m| m.phone_number_id.clone());

                // Delivery/read status callbacks carry no customer message.
                for message in value.messages {
                    let text = message_text(&message);
                    let timestamp = message
                        .timestamp
                        .as_deref()
                        .and_then(|raw| raw.parse::<i64>().ok())
                        .map(from_unix_seconds)
                        .unwrap_or_else(chrono::Utc::now);
                    events.push(NormalizedEvent {
                        platform: Platform::WhatsApp,
                        external_conversation_id: message.from.clone(),
                        external_message_id: message.id.clone(),
                        sender_display_name: names.get(&message.from).cloned(),
                        sender_id: message.from.clone(),
                        text,
                        timestamp,
                        metadata: json!({
                            "message_type": message.message_type,
                            "phone_number_id": business_number,
                        }),
                        is_echo: false,
                    });
                }
            }
        }
        Ok(events)
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let (Some(url), Some(token)) = (self.messages_url(), self.settings.access_token.as_deref())
        else {
            return SendOutcome::failed("whatsapp access token or phone number id not configured");
        };
        let body = json!({
            "messaging_product": "whatsapp",
            "recipient_type": "individual",
            "to": recipient_id,
            "type": "text",
            "text": { "body": text },
        });
        post(
            &url,
            Auth::Bearer(token),
            Payload::Json(&body),
            self.settings.send_timeout(),
            |body| body.pointer("/messages/0/id")?.as_str().map(str::to_string),
        )
    }

    fn answer_challenge(&self, query: &HashMap<String, String>) -> Result<String, AdapterError> {
        answer_hub_subscription(query, self.settings.verify_token.as_deref())
    }

    fn own_account_id(&self) -> Option<&str> {
        self.settings.sender_address.as_deref()
    }
}

fn message_text(message: &WhatsAppMessage) -> String {
    if let Some(text) = message.text.as_ref() {
        return text.body.clone();
    }
    if let Some(button) = message.button.as_ref() {
        return button.text.clone();
    }
    if let Some(reply) = message.interactive.as_ref().and_then(|i| {
        i.button_reply
            .as_ref()
            .or(i.list_reply.as_ref())
            .map(|r| r.title.clone())
    }) {
        return reply;
    }
    let caption = ["image", "video", "document"]
        .iter()
        .find_map(|kind| message.media.get(*kind))
        .and_then(|media| media.get("caption"))
        .and_then(Value::as_str);
    match caption {
        Some(caption) => format!("{} {}", media_placeholder(&message.message_type), caption),
        None => media_placeholder(&message.message_type),
    }
}

#[derive(Debug, Deserialize)]
struct WhatsAppWebhook {
    #[serde(default)]
    entry: Vec<WhatsAppEntry>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppEntry {
    #[serde(default)]
    changes: Vec<WhatsAppChange>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppChange {
    value: WhatsAppValue,
}

#[derive(Debug, Deserialize)]
struct WhatsAppValue {
    #[serde(default)]
    metadata: Option<WhatsAppMetadata>,
    #[serde(default)]
    contacts: Vec<WhatsAppContact>,
    #[serde(default)]
    messages: Vec<WhatsAppMessage>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMetadata {
    #[serde(default)]
    phone_number_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppContact {
    wa_id: String,
    #[serde(default)]
    profile: Option<WhatsAppProfile>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppProfile {
    name: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppMessage {
    id: String,
    from: String,
    #[serde(default)]
    timestamp: Option<String>,
    #[serde(rename = "type", default)]
    message_type: String,
    #[serde(default)]
    text: Option<WhatsAppText>,
    #[serde(default)]
    button: Option<WhatsAppButton>,
    #[serde(default)]
    interactive: Option<WhatsAppInteractive>,
    #[serde(flatten)]
    media: HashMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppText {
    body: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppButton {
    text: String,
}

#[derive(Debug, Deserialize)]
struct WhatsAppInteractive {
    #[serde(default)]
    button_reply: Option<WhatsAppReply>,
    #[serde(default)]
    list_reply: Option<WhatsAppReply>,
}

#[derive(Debug, Deserialize)]
struct WhatsAppReply {
    title: String,
}
