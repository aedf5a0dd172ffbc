use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ReplyError {
    #[error("generation timed out after {0:?}")]
    Timeout(Duration),
    #[error("generation service error: {0}")]
    Upstream(String),
    #[error("malformed generation response: {0}")]
    Malformed(String),
    #[error("generator config error: {0}")]
    Config(String),
}

impl ReplyError {
    /// Errors that a later attempt could plausibly recover from.
    pub fn is_transient(&self) -> bool {
        matches!(self, ReplyError::Timeout(_) | ReplyError::Upstream(_))
    }
}

impl From<reqwest::Error> for ReplyError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ReplyError::Timeout(Duration::ZERO)
        } else if err.is_decode() {
            ReplyError::Malformed(err.to_string())
        } else {
            ReplyError::Upstream(err.to_string())
        }
    }
}
