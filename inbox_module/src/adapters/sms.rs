//! SMS through Twilio programmable messaging.

use std::collections::HashMap;

use axum::http::HeaderMap;
use chrono::Utc;
use serde_json::json;

use super::signature::{signing_secret, verify_base64_sha1};
use super::{api_base, media_placeholder, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://api.twilio.com";

#[derive(Debug, Clone)]
pub struct TwilioSmsAdapter {
    settings: ChannelSettings,
}

impl TwilioSmsAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

/// Twilio signs the webhook URL followed by every form field as `name` +
/// `value`, sorted by name. Repeated fields each contribute, in value order.
pub(crate) fn twilio_signing_payload(url: &str, params: &[(String, String)]) -> String {
    let mut sorted: Vec<_> = params.iter().collect();
    sorted.sort();
    let mut data = url.to_string();
    for (key, value) in sorted {
        data.push_str(key);
        data.push_str(value);
    }
    data
}

impl ChannelAdapter for TwilioSmsAdapter {
    fn platform(&self) -> Platform {
        Platform::Sms
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(token) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let url = self
            .settings
            .webhook_url
            .as_deref()
            .ok_or(AdapterError::Authentication("webhook_url_not_configured"))?;
        let signature = header_str(headers, "x-twilio-signature")
            .ok_or(AdapterError::Authentication("missing_signature"))?;
        let params: Vec<(String, String)> = serde_urlencoded::from_bytes(raw_body)
            .map_err(|_| AdapterError::Authentication("bad_form"))?;
        verify_base64_sha1(token, twilio_signing_payload(url, &params).as_bytes(), signature)
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let params: HashMap<String, String> =
            serde_urlencoded::from_bytes(raw_body).map_err(|e| AdapterError::Parse(e.to_string()))?;
        let field = |name: &str| params.get(name).map(String::as_str).filter(|v| !v.is_empty());

        let from = field("From").ok_or_else(|| AdapterError::Parse("missing From".to_string()))?;
        let message_sid = field("MessageSid")
            .or_else(|| field("SmsSid"))
            .ok_or_else(|| AdapterError::Parse("missing MessageSid".to_string()))?;
        let media_count: usize = field("NumMedia").and_then(|n| n.parse().ok()).unwrap_or(0);
        let text = match field("Body") {
            Some(body) => body.to_string(),
            None if media_count > 0 => {
                let kind = field("MediaContentType0")
                    .and_then(|ct| ct.split('/').next())
                    .unwrap_or("media");
                media_placeholder(kind)
            }
            None => String::new(),
        };

        Ok(vec![NormalizedEvent {
            platform: Platform::Sms,
            external_conversation_id: from.to_string(),
            external_message_id: message_sid.to_string(),
            sender_id: from.to_string(),
            sender_display_name: field("ProfileName").map(str::to_string),
            text,
            timestamp: Utc::now(),
            metadata: json!({
                "to": field("To"),
                "account_sid": field("AccountSid"),
                "num_media": media_count,
            }),
            is_echo: false,
        }])
    }

    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let (Some(account_sid), Some(token), Some(from)) = (
            self.settings.account_id.as_deref(),
            self.settings.access_token.as_deref().or(self.settings.secret()),
            self.settings.sender_address.as_deref(),
        ) else {
            return SendOutcome::failed("twilio account sid, auth token or sender number not configured");
        };
        let url = format!(
            "{}/2010-04-01/Accounts/{}/Messages.json",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE),
            account_sid
        );
        let form = [("To", recipient_id), ("From", from), ("Body", text)];
        post(
            &url,
            Auth::Basic(account_sid, token),
            Payload::Form(&form),
            self.settings.send_timeout(),
            |body| body.get("sid")?.as_str().map(str::to_string),
        )
    }

    fn own_account_id(&self) -> Option<&str> {
        self.settings.sender_address.as_deref()
    }
}
