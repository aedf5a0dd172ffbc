use std::time::Duration;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f64 = 0.7;
pub const DEFAULT_CONTEXT_MESSAGES: usize = 10;
pub(crate) const DEFAULT_GENERATION_TIMEOUT: Duration = Duration::from_secs(20);
/// Timed-out generations allowed to keep running in the background.
pub(crate) const DEFAULT_MAX_RUNNING_GENERATIONS: usize = 32;
pub const DEFAULT_FALLBACK_REPLY: &str = "Thanks for your message. We could not prepare an answer right now, \
so a member of our support team will follow up shortly. You can also reach us at support@example.com.";

/// Longest single turn forwarded to the generation service.
pub(crate) const MAX_TURN_CHARS: usize = 2_000;

pub(crate) const SYSTEM_PROMPT: &str = r#"You are a customer support assistant replying inside a messaging app.

Rules:
- Answer using only the conversation and customer data below.
- Keep replies short and plain text; no markdown.
- If you are not sure, say that a human agent will follow up and report a low confidence.
"#;
