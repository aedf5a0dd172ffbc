use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// External messaging platforms with a webhook adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Platform {
    #[serde(rename = "whatsapp")]
    WhatsApp,
    #[serde(rename = "messenger")]
    Messenger,
    #[serde(rename = "instagram")]
    Instagram,
    #[serde(rename = "twitter")]
    Twitter,
    #[serde(rename = "sms")]
    Sms,
    #[serde(rename = "telegram")]
    Telegram,
    #[serde(rename = "youtube")]
    YouTube,
    #[serde(rename = "livechat")]
    LiveChat,
}

impl Platform {
    pub const ALL: [Platform; 8] = [
        Platform::WhatsApp,
        Platform::Messenger,
        Platform::Instagram,
        Platform::Twitter,
        Platform::Sms,
        Platform::Telegram,
        Platform::YouTube,
        Platform::LiveChat,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Platform::WhatsApp => "whatsapp",
            Platform::Messenger => "messenger",
            Platform::Instagram => "instagram",
            Platform::Twitter => "twitter",
            Platform::Sms => "sms",
            Platform::Telegram => "telegram",
            Platform::YouTube => "youtube",
            Platform::LiveChat => "livechat",
        }
    }

    /// Conversational channels start a fresh conversation after the previous
    /// one was resolved; live-chat sessions manage their own lifecycle.
    pub fn is_conversational(&self) -> bool {
        !matches!(self, Platform::LiveChat)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Platform {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "whatsapp" => Ok(Platform::WhatsApp),
            "messenger" | "facebook" => Ok(Platform::Messenger),
            "instagram" => Ok(Platform::Instagram),
            "twitter" | "x" => Ok(Platform::Twitter),
            "sms" | "twilio" => Ok(Platform::Sms),
            "telegram" => Ok(Platform::Telegram),
            "youtube" => Ok(Platform::YouTube),
            "livechat" | "live_chat" => Ok(Platform::LiveChat),
            other => Err(format!("unknown platform: {}", other)),
        }
    }
}

/// Platform-independent view of one inbound customer message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedEvent {
    pub platform: Platform,
    pub external_conversation_id: String,
    pub external_message_id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_display_name: Option<String>,
    /// Message text, or a typed placeholder such as `[image]` for media.
    pub text: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Value,
    /// Set by adapters whose payload marks self-sent messages explicitly.
    #[serde(default)]
    pub is_echo: bool,
}

/// Result of an outbound send, kept for delivery diagnostics.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendOutcome {
    pub ok: bool,
    pub status_code: Option<u16>,
    pub response_body: Option<String>,
    pub error_detail: Option<String>,
    /// Platform-native id of the delivered message, when the API returns one.
    pub external_id: Option<String>,
}

impl SendOutcome {
    pub fn failed(detail: impl Into<String>) -> Self {
        Self {
            ok: false,
            error_detail: Some(detail.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum AdapterError {
    #[error("authentication failed: {0}")]
    Authentication(&'static str),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("challenge rejected: {0}")]
    Challenge(&'static str),
    #[error("challenge not supported by {0}")]
    ChallengeUnsupported(Platform),
}

/// One implementation per platform: verify, parse, send.
pub trait ChannelAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Checks the webhook signature; `Err(AdapterError::Authentication)` rejects the request.
    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError>;

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError>;

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome;

    /// Answers a GET verification handshake with the plain-text body the platform expects.
    fn answer_challenge(&self, _query: &HashMap<String, String>) -> Result<String, AdapterError> {
        Err(AdapterError::ChallengeUnsupported(self.platform()))
    }

    /// Account or page id the adapter sends as; events from it are echoes.
    fn own_account_id(&self) -> Option<&str> {
        None
    }
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
}
