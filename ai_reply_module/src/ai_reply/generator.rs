use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError};
use reqwest::blocking::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::constants::{DEFAULT_GENERATION_TIMEOUT, DEFAULT_MAX_RUNNING_GENERATIONS};
use super::context::build_prompt;
use super::errors::ReplyError;
use super::types::{GeneratedReply, ReplyRequest, TurnRole};

/// External text-generation collaborator.
pub trait ReplyGenerator: Send + Sync {
    fn generate(&self, request: &ReplyRequest) -> Result<GeneratedReply, ReplyError>;
}

impl<G: ReplyGenerator + ?Sized> ReplyGenerator for Arc<G> {
    fn generate(&self, request: &ReplyRequest) -> Result<GeneratedReply, ReplyError> {
        (**self).generate(request)
    }
}

#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub endpoint: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub timeout: Duration,
}

impl GeneratorConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            api_key: None,
            model: None,
            timeout: DEFAULT_GENERATION_TIMEOUT,
        }
    }
}

/// Calls a JSON generation endpoint that answers `{"reply": "...", "confidence": 0.83}`.
#[derive(Debug, Clone)]
pub struct HttpReplyGenerator {
    config: GeneratorConfig,
    client: Client,
}

impl HttpReplyGenerator {
    pub fn new(config: GeneratorConfig) -> Result<Self, ReplyError> {
        if config.endpoint.trim().is_empty() {
            return Err(ReplyError::Config("generation endpoint is empty".to_string()));
        }
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| ReplyError::Config(err.to_string()))?;
        Ok(Self { config, client })
    }
}

#[derive(Debug, Serialize)]
struct GenerationRequestBody<'a> {
    conversation_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    prompt: String,
    messages: Vec<GenerationTurn<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    customer_data: Option<&'a serde_json::Value>,
}

#[derive(Debug, Serialize)]
struct GenerationTurn<'a> {
    role: TurnRole,
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerationResponseBody {
    #[serde(alias = "text")]
    reply: Option<String>,
    confidence: Option<f64>,
}

impl ReplyGenerator for HttpReplyGenerator {
    fn generate(&self, request: &ReplyRequest) -> Result<GeneratedReply, ReplyError> {
        let body = GenerationRequestBody {
            conversation_id: &request.conversation_id,
            model: self.config.model.as_deref(),
            prompt: build_prompt(request),
            messages: request
                .turns
                .iter()
                .map(|turn| GenerationTurn {
                    role: turn.role,
                    text: &turn.text,
                })
                .collect(),
            customer_data: request.customer_data.as_ref(),
        };

        let mut call = self.client.post(&self.config.endpoint).json(&body);
        if let Some(key) = self.config.api_key.as_deref() {
            call = call.header("Authorization", format!("Bearer {}", key));
        }
        let response = call.send().map_err(|err| match ReplyError::from(err) {
            ReplyError::Timeout(_) => ReplyError::Timeout(self.config.timeout),
            other => other,
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().unwrap_or_default();
            return Err(ReplyError::Upstream(format!("status {}: {}", status, text)));
        }

        let parsed: GenerationResponseBody = response.json()?;
        let text = parsed
            .reply
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| ReplyError::Malformed("missing reply text".to_string()))?;
        let confidence = parsed
            .confidence
            .ok_or_else(|| ReplyError::Malformed("missing confidence".to_string()))?;

        Ok(GeneratedReply {
            text,
            confidence: confidence.clamp(0.0, 1.0),
            fallback: false,
        })
    }
}

/// Hard wall-clock limit around any generator.
///
/// A call that times out returns at once, but its worker thread runs until
/// the inner generator returns. The inner generator should carry its own
/// bound (as `HttpReplyGenerator` does); at most `max_running` workers are
/// kept, and calls beyond that fail fast instead of spawning more.
pub struct TimedGenerator {
    inner: Arc<dyn ReplyGenerator>,
    timeout: Duration,
    max_running: usize,
    running: Arc<AtomicUsize>,
}

impl TimedGenerator {
    pub fn new(inner: Arc<dyn ReplyGenerator>, timeout: Duration) -> Self {
        Self::with_max_running(inner, timeout, DEFAULT_MAX_RUNNING_GENERATIONS)
    }

    pub fn with_max_running(
        inner: Arc<dyn ReplyGenerator>,
        timeout: Duration,
        max_running: usize,
    ) -> Self {
        Self {
            inner,
            timeout,
            max_running: max_running.max(1),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Worker threads still inside the inner generator.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }
}

impl ReplyGenerator for TimedGenerator {
    fn generate(&self, request: &ReplyRequest) -> Result<GeneratedReply, ReplyError> {
        let max_running = self.max_running;
        let reserved = self
            .running
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |running| {
                (running < max_running).then_some(running + 1)
            })
            .is_ok();
        if !reserved {
            warn!(
                "generation skipped conversation_id={} running={}",
                request.conversation_id, max_running
            );
            return Err(ReplyError::Upstream(format!(
                "{} generations still running",
                max_running
            )));
        }

        let (done_tx, done_rx) = bounded(1);
        let inner = self.inner.clone();
        let running = self.running.clone();
        let request = request.clone();
        thread::spawn(move || {
            let result = inner.generate(&request);
            running.fetch_sub(1, Ordering::SeqCst);
            // Receiver is gone once the caller timed out.
            let _ = done_tx.send(result);
        });

        match done_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(ReplyError::Timeout(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ReplyError::Upstream("generator worker exited".to_string()))
            }
        }
    }
}

/// Generates a reply, degrading to `fallback_text` (confidence 0) on any failure.
pub fn generate_or_fallback(
    generator: &dyn ReplyGenerator,
    request: &ReplyRequest,
    fallback_text: &str,
) -> GeneratedReply {
    match generator.generate(request) {
        Ok(reply) if !reply.text.trim().is_empty() => {
            debug!(
                "generated reply for conversation {} confidence={:.2}",
                request.conversation_id, reply.confidence
            );
            GeneratedReply {
                confidence: if reply.confidence.is_nan() {
                    0.0
                } else {
                    reply.confidence.clamp(0.0, 1.0)
                },
                ..reply
            }
        }
        Ok(_) => {
            warn!(
                "empty generated reply for conversation {}, using fallback",
                request.conversation_id
            );
            fallback(fallback_text)
        }
        Err(err) => {
            warn!(
                "reply generation failed for conversation {} (transient={}): {}",
                request.conversation_id,
                err.is_transient(),
                err
            );
            fallback(fallback_text)
        }
    }
}

fn fallback(text: &str) -> GeneratedReply {
    GeneratedReply {
        text: text.to_string(),
        confidence: 0.0,
        fallback: true,
    }
}
