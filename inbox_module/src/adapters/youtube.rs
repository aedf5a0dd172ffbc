//! YouTube PubSubHubbub feed notifications.
//!
//! The hub posts Atom XML; entries are pulled out with a handful of
//! patterns since only a few flat elements are needed.

use std::collections::HashMap;
use std::sync::OnceLock;

use axum::http::HeaderMap;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::json;

use super::signature::{constant_time_eq, signing_secret, verify_prefixed_hex_sha1};
use super::{api_base, post, Auth, Payload};
use crate::channel::{header_str, AdapterError, ChannelAdapter, NormalizedEvent, Platform, SendOutcome};
use crate::config::ChannelSettings;

const DEFAULT_API_BASE: &str = "https://www.googleapis.com";

#[derive(Debug, Clone)]
pub struct YouTubeAdapter {
    settings: ChannelSettings,
}

impl YouTubeAdapter {
    pub fn new(settings: ChannelSettings) -> Self {
        Self { settings }
    }
}

impl ChannelAdapter for YouTubeAdapter {
    fn platform(&self) -> Platform {
        Platform::YouTube
    }

    fn verify(&self, headers: &HeaderMap, raw_body: &[u8]) -> Result<(), AdapterError> {
        let Some(secret) = signing_secret(&self.settings)? else {
            return Ok(());
        };
        let signature = header_str(headers, "x-hub-signature")
            .ok_or(AdapterError::Authentication("missing_signature"))?;
        verify_prefixed_hex_sha1(secret, raw_body, signature)
    }

    fn parse(&self, raw_body: &[u8]) -> Result<Vec<NormalizedEvent>, AdapterError> {
        let feed = std::str::from_utf8(raw_body)
            .map_err(|_| AdapterError::Parse("feed is not utf-8".to_string()))?;
        if !feed.contains("<feed") {
            return Err(AdapterError::Parse("missing atom feed element".to_string()));
        }

        let mut events = Vec::new();
        for entry in patterns().entry.captures_iter(feed) {
            let body = &entry[1];
            let Some(video_id) = element(body, "yt:videoId") else {
                continue;
            };
            let channel_id = element(body, "yt:channelId").unwrap_or_default();
            let entry_id = element(body, "id").unwrap_or_else(|| format!("yt:video:{}", video_id));
            let author = patterns()
                .author_name
                .captures(body)
                .map(|caps| unescape(&caps[1]));
            let timestamp = element(body, "published")
                .or_else(|| element(body, "updated"))
                .and_then(|raw| DateTime::parse_from_rfc3339(&raw).ok())
                .map(|dt| dt.with_timezone(&Utc))
                .unwrap_or_else(Utc::now);

            events.push(NormalizedEvent {
                platform: Platform::YouTube,
                external_conversation_id: video_id.clone(),
                external_message_id: entry_id,
                sender_id: channel_id.clone(),
                sender_display_name: author,
                text: element(body, "title").unwrap_or_default(),
                timestamp,
                metadata: json!({
                    "video_id": video_id,
                    "channel_id": channel_id,
                    "updated": element(body, "updated"),
                }),
                is_echo: false,
            });
        }
        Ok(events)
    }

    /// Posts a top-level comment on the video.
    fn send(&self, recipient_id: &str, text: &str) -> SendOutcome {
        let Some(token) = self.settings.access_token.as_deref() else {
            return SendOutcome::failed("youtube access token not configured");
        };
        let url = format!(
            "{}/youtube/v3/commentThreads?part=snippet",
            api_base(self.settings.api_base_url.as_deref(), DEFAULT_API_BASE)
        );
        let body = json!({
            "snippet": {
                "videoId": recipient_id,
                "topLevelComment": { "snippet": { "textOriginal": text } }
            }
        });
        post(
            &url,
            Auth::Bearer(token),
            Payload::Json(&body),
            self.settings.send_timeout(),
            |body| body.get("id")?.as_str().map(str::to_string),
        )
    }

    /// The hub echoes `hub.challenge` on subscribe and unsubscribe; a
    /// configured verify token must match `hub.verify_token`.
    fn answer_challenge(&self, query: &HashMap<String, String>) -> Result<String, AdapterError> {
        let mode = query.get("hub.mode").map(String::as_str);
        if !matches!(mode, Some("subscribe") | Some("unsubscribe")) {
            return Err(AdapterError::Challenge("invalid_mode"));
        }
        if let Some(expected) = self
            .settings
            .verify_token
            .as_deref()
            .map(str::trim)
            .filter(|token| !token.is_empty())
        {
            let provided = query
                .get("hub.verify_token")
                .ok_or(AdapterError::Challenge("missing_token"))?;
            if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
                return Err(AdapterError::Challenge("token_mismatch"));
            }
        }
        query
            .get("hub.challenge")
            .cloned()
            .ok_or(AdapterError::Challenge("missing_challenge"))
    }
}

struct FeedPatterns {
    entry: Regex,
    author_name: Regex,
}

fn patterns() -> &'static FeedPatterns {
    static PATTERNS: OnceLock<FeedPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| FeedPatterns {
        entry: Regex::new(r"(?s)<entry[^>]*>(.*?)</entry>").expect("valid entry regex"),
        author_name: Regex::new(r"(?s)<author>.*?<name>(.*?)</name>").expect("valid author regex"),
    })
}

fn element(body: &str, tag: &str) -> Option<String> {
    let open = format!("<{}>", tag);
    let close = format!("</{}>", tag);
    let start = body.find(&open)? + open.len();
    let end = body[start..].find(&close)? + start;
    let value = unescape(body[start..end].trim());
    (!value.is_empty()).then_some(value)
}

fn unescape(value: &str) -> String {
    value
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&apos;", "'")
        .replace("&amp;", "&")
}
