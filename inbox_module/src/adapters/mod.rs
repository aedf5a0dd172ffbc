//! Channel adapters for the supported messaging platforms.
//!
//! Each adapter verifies, parses and sends for one platform; the registry
//! maps webhook path names onto them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value;
use tracing::warn;

use crate::channel::{AdapterError, ChannelAdapter, Platform, SendOutcome};
use crate::config::RouterConfig;

pub mod livechat;
pub mod meta;
pub(crate) mod signature;
pub mod sms;
pub mod telegram;
pub mod twitter;
pub mod whatsapp;
pub mod youtube;

pub use livechat::LiveChatAdapter;
pub use meta::MetaMessagingAdapter;
pub use sms::TwilioSmsAdapter;
pub use telegram::TelegramAdapter;
pub use twitter::TwitterAdapter;
pub use whatsapp::WhatsAppAdapter;
pub use youtube::YouTubeAdapter;

#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Platform, Arc<dyn ChannelAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds an adapter for every enabled channel.
    pub fn from_config(config: &RouterConfig) -> Self {
        let mut registry = Self::new();
        for platform in Platform::ALL {
            let settings = config.channel(platform);
            if !settings.enabled {
                continue;
            }
            let adapter: Arc<dyn ChannelAdapter> = match platform {
                Platform::WhatsApp => Arc::new(WhatsAppAdapter::new(settings)),
                Platform::Messenger | Platform::Instagram => {
                    Arc::new(MetaMessagingAdapter::new(platform, settings))
                }
                Platform::Twitter => Arc::new(TwitterAdapter::new(settings)),
                Platform::Sms => Arc::new(TwilioSmsAdapter::new(settings)),
                Platform::Telegram => Arc::new(TelegramAdapter::new(settings)),
                Platform::YouTube => Arc::new(YouTubeAdapter::new(settings)),
                Platform::LiveChat => Arc::new(LiveChatAdapter::new(settings)),
            };
            registry.register(adapter);
        }
        registry
    }

    pub fn register(&mut self, adapter: Arc<dyn ChannelAdapter>) {
        self.adapters.insert(adapter.platform(), adapter);
    }

    pub fn get(&self, platform: Platform) -> Option<Arc<dyn ChannelAdapter>> {
        self.adapters.get(&platform).cloned()
    }

    /// Looks an adapter up by its webhook path name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ChannelAdapter>, AdapterError> {
        let platform = name
            .parse::<Platform>()
            .map_err(|_| AdapterError::UnknownPlatform(name.to_string()))?;
        self.get(platform)
            .ok_or_else(|| AdapterError::UnknownPlatform(name.to_string()))
    }

    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<_> = self.adapters.keys().copied().collect();
        platforms.sort_by_key(|platform| platform.as_str());
        platforms
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("platforms", &self.platforms())
            .finish()
    }
}

pub(crate) enum Auth<'a> {
    Bearer(&'a str),
    Basic(&'a str, &'a str),
    None,
}

pub(crate) enum Payload<'a> {
    Json(&'a Value),
    Form(&'a [(&'a str, &'a str)]),
}

/// POSTs to a platform API. Transport failures and non-2xx responses come
/// back as a failed `SendOutcome`; `extract_id` reads the platform message id
/// from a JSON response body.
pub(crate) fn post(
    url: &str,
    auth: Auth<'_>,
    payload: Payload<'_>,
    timeout: Duration,
    extract_id: fn(&Value) -> Option<String>,
) -> SendOutcome {
    let client = match reqwest::blocking::Client::builder().timeout(timeout).build() {
        Ok(client) => client,
        Err(err) => return SendOutcome::failed(format!("http client error: {}", err)),
    };
    let mut request = client.post(url);
    request = match auth {
        Auth::Bearer(token) => request.bearer_auth(token),
        Auth::Basic(user, password) => request.basic_auth(user, Some(password)),
        Auth::None => request,
    };
    request = match payload {
        Payload::Json(body) => request.json(body),
        Payload::Form(fields) => request.form(fields),
    };

    let response = match request.send() {
        Ok(response) => response,
        Err(err) => {
            let detail = if err.is_timeout() {
                format!("timeout after {}s", timeout.as_secs())
            } else {
                err.to_string()
            };
            warn!("platform send failed url={}: {}", url, detail);
            return SendOutcome::failed(detail);
        }
    };
    let status = response.status();
    let body = response.text().unwrap_or_default();
    let parsed: Option<Value> = serde_json::from_str(&body).ok();
    let ok = status.is_success();
    let error_detail = if ok {
        None
    } else {
        Some(
            parsed
                .as_ref()
                .and_then(error_message)
                .unwrap_or_else(|| format!("http status {}", status.as_u16())),
        )
    };
    SendOutcome {
        ok,
        status_code: Some(status.as_u16()),
        external_id: parsed.as_ref().filter(|_| ok).and_then(extract_id),
        response_body: Some(body),
        error_detail,
    }
}

fn error_message(body: &Value) -> Option<String> {
    body.pointer("/error/message")
        .or_else(|| body.get("description"))
        .or_else(|| body.get("message"))
        .or_else(|| body.pointer("/errors/0/message"))
        .or_else(|| body.get("detail"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(crate) fn api_base<'a>(configured: Option<&'a str>, default: &'a str) -> &'a str {
    configured
        .map(|base| base.trim_end_matches('/'))
        .filter(|base| !base.is_empty())
        .unwrap_or(default)
}

pub(crate) fn from_unix_seconds(seconds: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(seconds, 0).single().unwrap_or_else(Utc::now)
}

pub(crate) fn from_unix_millis(millis: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .unwrap_or_else(Utc::now)
}

pub(crate) fn media_placeholder(kind: &str) -> String {
    format!("[{}]", kind)
}
