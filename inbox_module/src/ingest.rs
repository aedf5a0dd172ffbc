//! Webhook ingestion: verify, parse, thread, store, enqueue.
//!
//! Nothing here waits on the AI service or a platform send; the webhook is
//! acknowledged as soon as the message is durable and queued.

use std::collections::HashMap;
use std::sync::Arc;

use axum::http::HeaderMap;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::adapters::AdapterRegistry;
use crate::channel::{AdapterError, ChannelAdapter, NormalizedEvent};
use crate::config::RouterConfig;
use crate::conversation::NewMessage;
use crate::directory::{ConversationDirectory, IdentityHints};
use crate::dispatcher::{Dispatcher, Job};
use crate::messages::MessageStore;
use crate::routing::{decide, RoutingDecision, RoutingInput};
use crate::store::{Database, StoreError};

pub const STATUS_ACCEPTED: &str = "accepted";
pub const STATUS_DUPLICATE: &str = "duplicate";
pub const STATUS_IGNORED: &str = "ignored";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WebhookAck {
    pub status: String,
    pub message: String,
}

impl WebhookAck {
    pub fn new(status: &str, message: impl Into<String>) -> Self {
        Self {
            status: status.to_string(),
            message: message.into(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("authentication failed: {0}")]
    AuthenticationFailure(&'static str),
    #[error("unknown platform: {0}")]
    UnknownPlatform(String),
    #[error("unrecoverable payload: {0}")]
    Unrecoverable(String),
    #[error("challenge rejected: {0}")]
    ChallengeRejected(&'static str),
    #[error("persistence conflict: {0}")]
    PersistenceConflict(#[source] StoreError),
    #[error("storage error: {0}")]
    Storage(#[source] StoreError),
}

impl From<StoreError> for IngestError {
    fn from(err: StoreError) -> Self {
        if err.is_retryable() {
            IngestError::PersistenceConflict(err)
        } else {
            IngestError::Storage(err)
        }
    }
}

impl From<AdapterError> for IngestError {
    fn from(err: AdapterError) -> Self {
        match err {
            AdapterError::Authentication(reason) => IngestError::AuthenticationFailure(reason),
            AdapterError::UnknownPlatform(name) => IngestError::UnknownPlatform(name),
            AdapterError::Challenge(reason) => IngestError::ChallengeRejected(reason),
            AdapterError::ChallengeUnsupported(_) => {
                IngestError::ChallengeRejected("challenge_unsupported")
            }
            AdapterError::Parse(detail) | AdapterError::Config(detail) => {
                IngestError::Unrecoverable(detail)
            }
        }
    }
}

/// What happened to one parsed event.
#[derive(Debug, Clone, PartialEq)]
pub enum EventDisposition {
    Echo,
    Duplicate {
        message_id: String,
        requeued: bool,
    },
    Accepted {
        conversation_id: String,
        message_id: String,
        decision: RoutingDecision,
    },
}

#[derive(Clone)]
pub struct IngestService {
    registry: AdapterRegistry,
    directory: ConversationDirectory,
    messages: MessageStore,
    dispatcher: Dispatcher,
    config: Arc<RouterConfig>,
}

impl IngestService {
    pub fn new(
        db: Database,
        config: Arc<RouterConfig>,
        registry: AdapterRegistry,
        dispatcher: Dispatcher,
    ) -> Self {
        Self {
            directory: ConversationDirectory::new(db.clone()),
            messages: MessageStore::new(db),
            registry,
            dispatcher,
            config,
        }
    }

    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// Full webhook path for a POST body.
    pub fn handle(
        &self,
        platform: &str,
        headers: &HeaderMap,
        raw_body: &[u8],
    ) -> Result<WebhookAck, IngestError> {
        let adapter = self.registry.resolve(platform)?;
        adapter.verify(headers, raw_body)?;
        let events = adapter.parse(raw_body)?;
        if events.is_empty() {
            debug!("webhook carried no messages platform={}", platform);
            return Ok(WebhookAck::new(STATUS_IGNORED, "no messages"));
        }

        let (mut accepted, mut duplicates, mut echoes) = (0usize, 0usize, 0usize);
        for event in events {
            match self.ingest_event(adapter.as_ref(), event)? {
                EventDisposition::Echo => echoes += 1,
                EventDisposition::Duplicate { .. } => duplicates += 1,
                EventDisposition::Accepted { .. } => accepted += 1,
            }
        }

        let status = if accepted > 0 {
            STATUS_ACCEPTED
        } else if duplicates > 0 {
            STATUS_DUPLICATE
        } else {
            STATUS_IGNORED
        };
        Ok(WebhookAck::new(
            status,
            format!(
                "accepted={} duplicate={} echo={}",
                accepted, duplicates, echoes
            ),
        ))
    }

    /// Stores one event and queues it for a reply unless it is an echo of
    /// our own send or a redelivery.
    pub fn ingest_event(
        &self,
        adapter: &dyn ChannelAdapter,
        event: NormalizedEvent,
    ) -> Result<EventDisposition, IngestError> {
        if event.is_echo || adapter.own_account_id() == Some(event.sender_id.as_str()) {
            debug!(
                "dropping echo platform={} message_id={}",
                event.platform, event.external_message_id
            );
            return Ok(EventDisposition::Echo);
        }

        let hints = IdentityHints {
            customer_id: Some(event.sender_id.clone()),
            customer_name: event.sender_display_name.clone(),
        };
        let resolution =
            self.directory
                .resolve(event.platform, &event.external_conversation_id, &hints, false)?;

        let message = NewMessage::inbound(
            &event.external_message_id,
            &event.sender_id,
            &event.text,
            event.timestamp,
        )
        .with_metadata(event.metadata);
        let appended = self.messages.append(&resolution.conversation_id, message)?;
        if !appended.inserted {
            let stored = self.messages.require(&appended.message_id)?;
            let requeued = !stored.processed_by_ai && !stored.handled_by_agent;
            info!(
                "duplicate delivery platform={} external_id={} message_id={} requeued={}",
                event.platform, event.external_message_id, appended.message_id, requeued
            );
            // Recovers a job that gave up. If the earlier job is still
            // running, the pipeline sees the flags and skips this one.
            if requeued {
                self.submit(Job::new(&stored.conversation_id, &stored.id, event.platform));
            }
            return Ok(EventDisposition::Duplicate {
                message_id: appended.message_id,
                requeued,
            });
        }

        let conversation = self.directory.require(&resolution.conversation_id)?;
        let channel = self.config.channel(event.platform);
        let decision = decide(&RoutingInput::snapshot(&conversation, &channel));
        info!(
            "message accepted platform={} conversation_id={} message_id={} created={} decision={:?}",
            event.platform,
            resolution.conversation_id,
            appended.message_id,
            resolution.created,
            decision
        );

        self.submit(Job::new(&resolution.conversation_id, &appended.message_id, event.platform));
        Ok(EventDisposition::Accepted {
            conversation_id: resolution.conversation_id,
            message_id: appended.message_id,
            decision,
        })
    }

    /// The message is already durable, so a failed submit is logged and the
    /// webhook still acknowledged; the next redelivery queues it again.
    fn submit(&self, job: Job) {
        let (conversation_id, message_id) = (job.conversation_id.clone(), job.message_id.clone());
        if let Err(err) = self.dispatcher.submit(job) {
            error!(
                "failed to queue message conversation_id={} message_id={}: {}",
                conversation_id, message_id, err
            );
        }
    }

    /// GET verification handshake.
    pub fn answer_challenge(
        &self,
        platform: &str,
        query: &HashMap<String, String>,
    ) -> Result<String, IngestError> {
        let adapter = self.registry.resolve(platform)?;
        adapter.answer_challenge(query).map_err(|err| {
            warn!("challenge rejected platform={}: {}", platform, err);
            IngestError::from(err)
        })
    }
}

impl std::fmt::Debug for IngestService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestService")
            .field("registry", &self.registry)
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflicts_map_to_persistence_conflict() {
        let err = IngestError::from(StoreError::Conflict {
            entity: "conversation",
            attempts: 5,
        });
        assert!(matches!(err, IngestError::PersistenceConflict(_)));
        let err = IngestError::from(StoreError::Invalid("bad".to_string()));
        assert!(matches!(err, IngestError::Storage(_)));
    }

    #[test]
    fn adapter_errors_follow_taxonomy() {
        assert!(matches!(
            IngestError::from(AdapterError::Authentication("invalid_signature")),
            IngestError::AuthenticationFailure("invalid_signature")
        ));
        assert!(matches!(
            IngestError::from(AdapterError::Parse("eof".to_string())),
            IngestError::Unrecoverable(_)
        ));
        assert!(matches!(
            IngestError::from(AdapterError::UnknownPlatform("fax".to_string())),
            IngestError::UnknownPlatform(_)
        ));
    }
}
