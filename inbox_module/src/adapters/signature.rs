use std::collections::HashMap;

use base64::Engine;
use hmac::{Hmac, Mac};
use sha1::Sha1;
use sha2::Sha256;

use crate::channel::AdapterError;
use crate::config::ChannelSettings;

type HmacSha256 = Hmac<Sha256>;
type HmacSha1 = Hmac<Sha1>;

/// Signing secret for the channel. `Ok(None)` means the channel runs in
/// tolerant mode and accepts unsigned requests.
pub(crate) fn signing_secret(settings: &ChannelSettings) -> Result<Option<&str>, AdapterError> {
    match settings.secret() {
        Some(secret) => Ok(Some(secret)),
        None if settings.allow_unsigned => Ok(None),
        None => Err(AdapterError::Authentication("secret_not_configured")),
    }
}

pub(crate) fn hmac_sha256(secret: &str, data: &[u8]) -> Result<Vec<u8>, AdapterError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::Authentication("bad_secret"))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Checks `<prefix><hex digest>` headers such as `sha256=ab12...`.
pub(crate) fn verify_prefixed_hex_sha256(
    secret: &str,
    body: &[u8],
    header: &str,
) -> Result<(), AdapterError> {
    let provided = decode_prefixed_hex(header, "sha256=")?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::Authentication("bad_secret"))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AdapterError::Authentication("invalid_signature"))
}

pub(crate) fn verify_prefixed_hex_sha1(
    secret: &str,
    body: &[u8],
    header: &str,
) -> Result<(), AdapterError> {
    let provided = decode_prefixed_hex(header, "sha1=")?;
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::Authentication("bad_secret"))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AdapterError::Authentication("invalid_signature"))
}

pub(crate) fn verify_base64_sha256(
    secret: &str,
    body: &[u8],
    encoded: &str,
) -> Result<(), AdapterError> {
    let provided = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AdapterError::Authentication("malformed_signature"))?;
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::Authentication("bad_secret"))?;
    mac.update(body);
    mac.verify_slice(&provided)
        .map_err(|_| AdapterError::Authentication("invalid_signature"))
}

pub(crate) fn verify_base64_sha1(
    secret: &str,
    data: &[u8],
    encoded: &str,
) -> Result<(), AdapterError> {
    let provided = base64::engine::general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|_| AdapterError::Authentication("malformed_signature"))?;
    let mut mac = HmacSha1::new_from_slice(secret.as_bytes())
        .map_err(|_| AdapterError::Authentication("bad_secret"))?;
    mac.update(data);
    mac.verify_slice(&provided)
        .map_err(|_| AdapterError::Authentication("invalid_signature"))
}

fn decode_prefixed_hex(header: &str, prefix: &str) -> Result<Vec<u8>, AdapterError> {
    let digest = header
        .trim()
        .strip_prefix(prefix)
        .ok_or(AdapterError::Authentication("malformed_signature"))?;
    hex::decode(digest).map_err(|_| AdapterError::Authentication("malformed_signature"))
}

pub(crate) fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Meta-style subscription handshake: `hub.mode=subscribe`, matching
/// `hub.verify_token`, echo `hub.challenge`.
pub(crate) fn answer_hub_subscription(
    query: &HashMap<String, String>,
    verify_token: Option<&str>,
) -> Result<String, AdapterError> {
    let expected = verify_token
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .ok_or(AdapterError::Challenge("verify_token_not_configured"))?;
    let mode = query.get("hub.mode").map(String::as_str);
    if !matches!(mode, Some("subscribe") | Some("unsubscribe")) {
        return Err(AdapterError::Challenge("invalid_mode"));
    }
    let provided = query
        .get("hub.verify_token")
        .ok_or(AdapterError::Challenge("missing_token"))?;
    if !constant_time_eq(provided.as_bytes(), expected.as_bytes()) {
        return Err(AdapterError::Challenge("token_mismatch"));
    }
    query
        .get("hub.challenge")
        .cloned()
        .ok_or(AdapterError::Challenge("missing_challenge"))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[test]
    fn tolerant_mode_requires_explicit_opt_in() {
        let strict = ChannelSettings::default();
        assert_eq!(
            signing_secret(&strict),
            Err(AdapterError::Authentication("secret_not_configured"))
        );
        let tolerant = ChannelSettings {
            allow_unsigned: true,
            ..Default::default()
        };
        assert_eq!(signing_secret(&tolerant), Ok(None));
        let blank = ChannelSettings {
            secret: Some("  ".to_string()),
            ..Default::default()
        };
        assert!(signing_secret(&blank).is_err());
    }

    #[test]
    fn prefixed_hex_signatures() {
        let body = br#"{"object":"page"}"#;
        let header = hex_sha256("s3cret", body);
        assert!(verify_prefixed_hex_sha256("s3cret", body, &header).is_ok());
        assert_eq!(
            verify_prefixed_hex_sha256("other", body, &header),
            Err(AdapterError::Authentication("invalid_signature"))
        );
        assert_eq!(
            verify_prefixed_hex_sha256("s3cret", body, "md5=00"),
            Err(AdapterError::Authentication("malformed_signature"))
        );
        let sha1_header = hex_sha1("s3cret", body);
        assert!(verify_prefixed_hex_sha1("s3cret", body, &sha1_header).is_ok());
    }

    #[test]
    fn hub_subscription_echoes_challenge() {
        let query: HashMap<String, String> = [
            ("hub.mode", "subscribe"),
            ("hub.verify_token", "verify-me"),
            ("hub.challenge", "1158201444"),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
        assert_eq!(
            answer_hub_subscription(&query, Some("verify-me")).as_deref(),
            Ok("1158201444")
        );
        assert_eq!(
            answer_hub_subscription(&query, Some("nope")),
            Err(AdapterError::Challenge("token_mismatch"))
        );
        assert_eq!(
            answer_hub_subscription(&query, None),
            Err(AdapterError::Challenge("verify_token_not_configured"))
        );
    }

    #[test]
    fn constant_time_compare() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"abcd"));
    }
}
