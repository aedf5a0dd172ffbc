//! Reply pipeline run by the dispatcher for each accepted inbound message.

use std::sync::Arc;

use ai_reply_module::{
    build_context, generate_or_fallback, ConfidenceGate, ContextTurn, ReplyGenerator,
    ReplyRequest, TimedGenerator, TurnRole,
};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::adapters::AdapterRegistry;
use crate::channel::SendOutcome;
use crate::collaborators::{AgentAlert, AlertKind, Collaborators};
use crate::config::RouterConfig;
use crate::conversation::{Conversation, ConversationStatus, Message, MessageDirection, NewMessage};
use crate::directory::ConversationDirectory;
use crate::dispatcher::{DispatchError, Job, JobHandler};
use crate::escalation::{
    configure, EscalationEngine, EscalationOutcome, EscalationRequest, EscalationType, Priority,
    RecordOutcome, RequesterRole,
};
use crate::flow::FlowStep;
use crate::messages::MessageStore;
use crate::routing::{after_ai_reply, decide, MessageOwner, RoutingDecision, RoutingInput};
use crate::store::{Database, StoreError};

/// Author recorded on comments and messages the router writes itself.
pub const SYSTEM_ACTOR: &str = "system";
const AI_ACTOR: &str = "ai";

/// What a processed job ended up doing.
#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    Skipped(&'static str),
    FlowContinued,
    FlowCompleted,
    FlowAborted,
    AiReplied {
        confidence: f64,
        fallback: bool,
        delivered: bool,
        escalated: bool,
    },
    AgentNotified {
        agent_id: String,
    },
    Escalated(EscalationOutcome),
    AlreadyQueued,
}

#[derive(Clone)]
pub struct Pipeline {
    db: Database,
    directory: ConversationDirectory,
    messages: MessageStore,
    engine: EscalationEngine,
    registry: AdapterRegistry,
    config: Arc<RouterConfig>,
    generator: Arc<dyn ReplyGenerator>,
    gate: ConfidenceGate,
    collaborators: Collaborators,
    instance_id: String,
}

impl Pipeline {
    pub fn new(
        db: Database,
        config: Arc<RouterConfig>,
        registry: AdapterRegistry,
        generator: Arc<dyn ReplyGenerator>,
        collaborators: Collaborators,
    ) -> Self {
        let engine = EscalationEngine::new(
            db.clone(),
            config.escalation.clone(),
            collaborators.clone(),
        );
        Self {
            directory: ConversationDirectory::new(db.clone()),
            messages: MessageStore::new(db.clone()),
            generator: Arc::new(TimedGenerator::new(generator, config.ai_timeout())),
            gate: ConfidenceGate::new(config.routing.confidence_threshold),
            db,
            engine,
            registry,
            config,
            collaborators,
            instance_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn engine(&self) -> &EscalationEngine {
        &self.engine
    }

    /// Handles one inbound message under the conversation lease.
    pub fn process_ai_job(&self, job: &Job) -> Result<JobOutcome, DispatchError> {
        let holder = format!("{}:{}", self.instance_id, job.id);
        let ttl = chrono::Duration::seconds(self.config.dispatch.lease_secs.max(1));
        let Some(lease) = self.db.try_acquire_lease(&job.conversation_id, &holder, ttl)? else {
            debug!("conversation lease busy conversation_id={}", job.conversation_id);
            return Err(DispatchError::LeaseBusy(job.conversation_id.clone()));
        };
        let result = self.process_leased(job);
        if let Err(err) = lease.release() {
            warn!(
                "failed to release lease conversation_id={}: {}",
                job.conversation_id, err
            );
        }
        result
    }

    fn process_leased(&self, job: &Job) -> Result<JobOutcome, DispatchError> {
        let message = self.messages.require(&job.message_id)?;
        if message.direction != MessageDirection::Inbound {
            return Ok(JobOutcome::Skipped("not_inbound"));
        }
        if message.processed_by_ai || message.handled_by_agent {
            return Ok(JobOutcome::Skipped("already_processed"));
        }

        let mut conversation = self.directory.require(&job.conversation_id)?;
        if conversation.status.is_terminal() {
            conversation = self.reopen(&conversation)?;
        }
        let channel = self.config.channel(conversation.platform);
        let decision = decide(&RoutingInput::snapshot(&conversation, &channel));
        debug!(
            "routing decision conversation_id={} message_id={} decision={:?}",
            conversation.id, message.id, decision
        );

        let outcome = match decision {
            RoutingDecision::AnswerFlow => self.answer_flow(&conversation, &message)?,
            RoutingDecision::Route(MessageOwner::Ai) => self.reply_with_ai(&conversation, &message)?,
            RoutingDecision::Route(MessageOwner::AssignedAgent) => {
                self.notify_assigned_agent(&conversation, &message)?
            }
            RoutingDecision::Route(owner) => self.hand_to_humans(&conversation, &message, owner)?,
        };
        Ok(outcome)
    }

    /// Session-based channels keep one conversation per session; a message
    /// after resolution reopens it for automated handling.
    fn reopen(&self, conversation: &Conversation) -> Result<Conversation, StoreError> {
        info!(
            "reopening conversation id={} status={}",
            conversation.id, conversation.status
        );
        self.directory.update(&conversation.id, |current| {
            current.status = ConversationStatus::New;
            current.assigned_agent = None;
            current.requires_human_intervention = false;
        })
    }

    fn answer_flow(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<JobOutcome, StoreError> {
        let Some(state) = conversation.flow_state.clone() else {
            return Ok(JobOutcome::Skipped("no_active_flow"));
        };
        let routing = &self.config.routing;
        let step = state.advance(&message.content, &routing.exit_keywords, Utc::now());
        self.messages.mark_ai_processed(&message.id, None, false)?;

        match step {
            FlowStep::Continue { state, prompt } => {
                self.directory.set_flow_state(&conversation.id, Some(state))?;
                self.deliver(conversation, &prompt, json!({ "flow": "survey" }))?;
                Ok(JobOutcome::FlowContinued)
            }
            FlowStep::Completed { survey_id, answers } => {
                let answers = serde_json::to_string(&answers)?;
                self.directory.add_comment(
                    &conversation.id,
                    SYSTEM_ACTOR,
                    &format!("Survey {} completed: {}", survey_id, answers),
                )?;
                self.deliver(conversation, &routing.flow_completed_reply, json!({ "flow": "completed" }))?;
                self.directory
                    .terminate(&conversation.id, ConversationStatus::Resolved)?;
                info!(
                    "survey completed conversation_id={} survey_id={}",
                    conversation.id, survey_id
                );
                Ok(JobOutcome::FlowCompleted)
            }
            FlowStep::Aborted { survey_id, step } => {
                self.directory.add_comment(
                    &conversation.id,
                    SYSTEM_ACTOR,
                    &format!("Survey {} ended by customer at question {}", survey_id, step + 1),
                )?;
                self.deliver(conversation, &routing.flow_aborted_reply, json!({ "flow": "aborted" }))?;
                self.directory
                    .terminate(&conversation.id, ConversationStatus::Resolved)?;
                info!(
                    "survey aborted conversation_id={} survey_id={} step={}",
                    conversation.id, survey_id, step
                );
                Ok(JobOutcome::FlowAborted)
            }
        }
    }

    fn reply_with_ai(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<JobOutcome, StoreError> {
        let request = self.reply_request(conversation, message)?;
        let reply = generate_or_fallback(
            self.generator.as_ref(),
            &request,
            &self.config.ai.fallback_reply,
        );
        let outcome = self.deliver(
            conversation,
            &reply.text,
            json!({ "confidence": reply.confidence, "fallback": reply.fallback }),
        )?;

        let verdict = after_ai_reply(&self.gate, reply.confidence);
        self.messages.mark_ai_processed(
            &message.id,
            Some(reply.confidence),
            verdict.requires_escalation,
        )?;
        self.directory
            .set_status(&conversation.id, ConversationStatus::AiResponded)?;

        if verdict.requires_escalation {
            let reason = if reply.fallback {
                "automated reply unavailable".to_string()
            } else {
                format!(
                    "reply confidence {:.2} below {:.2}",
                    reply.confidence,
                    self.gate.threshold()
                )
            };
            let request =
                EscalationRequest::new(&conversation.id, EscalationType::LowConfidence, reason)
                    .with_actor(AI_ACTOR);
            let result = self.engine.escalate(&request)?;
            info!(
                "low confidence escalation conversation_id={} confidence={:.2} outcome={:?}",
                conversation.id, reply.confidence, result.outcome
            );
        }

        Ok(JobOutcome::AiReplied {
            confidence: reply.confidence,
            fallback: reply.fallback,
            delivered: outcome.ok,
            escalated: verdict.requires_escalation,
        })
    }

    fn reply_request(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<ReplyRequest, StoreError> {
        let limit = self.config.routing.context_messages.max(1);
        let history = self.messages.recent(&conversation.id, limit)?;
        let turns = history
            .into_iter()
            .map(|stored| ContextTurn {
                role: turn_role(&stored),
                text: stored.content,
                timestamp: stored.timestamp,
            })
            .collect();

        let customer_data = match conversation.customer_id.as_deref() {
            Some(customer_id) => match self
                .collaborators
                .customer_data
                .lookup(conversation.platform, customer_id)
            {
                Ok(data) => data,
                Err(err) => {
                    warn!(
                        "customer data lookup failed conversation_id={}: {}",
                        conversation.id, err
                    );
                    None
                }
            },
            None => None,
        };

        Ok(ReplyRequest {
            conversation_id: conversation.id.clone(),
            platform: conversation.platform.to_string(),
            customer_name: conversation.customer_name.clone(),
            turns: build_context(turns, limit),
            flow_summary: conversation.flow_state.as_ref().map(|state| state.summary()),
            customer_data,
            latest_message: message.content.clone(),
        })
    }

    fn notify_assigned_agent(
        &self,
        conversation: &Conversation,
        message: &Message,
    ) -> Result<JobOutcome, StoreError> {
        let Some(agent_id) = conversation.assigned_agent.clone() else {
            return Ok(JobOutcome::Skipped("no_assigned_agent"));
        };
        let last = self.engine.records_for(&conversation.id)?.into_iter().last();
        let plan = configure(
            last.as_ref()
                .map(|record| record.escalation_type)
                .unwrap_or(EscalationType::General),
            last.as_ref()
                .map(|record| record.requester_role)
                .unwrap_or(RequesterRole::Customer),
            Priority::Normal,
        );
        let alert = AgentAlert {
            kind: AlertKind::CustomerReplied,
            agent_id: Some(agent_id.clone()),
            department: last
                .as_ref()
                .map(|record| record.department.clone())
                .unwrap_or(plan.department),
            conversation_id: conversation.id.clone(),
            priority: last.as_ref().map(|record| record.priority).unwrap_or(plan.priority),
            contact_method: plan.contact_method,
            target_response_minutes: plan.target_response_minutes,
            reason: crate::messages::preview(&message.content),
        };
        if let Err(err) = self.collaborators.notifier.notify(&alert) {
            warn!(
                "agent notification failed conversation_id={} agent_id={}: {}",
                conversation.id, agent_id, err
            );
        }
        self.messages.mark_handled_by_agent(&message.id)?;
        debug!(
            "customer reply routed to agent conversation_id={} agent_id={}",
            conversation.id, agent_id
        );
        Ok(JobOutcome::AgentNotified { agent_id })
    }

    fn hand_to_humans(
        &self,
        conversation: &Conversation,
        message: &Message,
        owner: MessageOwner,
    ) -> Result<JobOutcome, StoreError> {
        let already_queued = self
            .engine
            .records_for(&conversation.id)?
            .iter()
            .any(|record| record.open && record.outcome == RecordOutcome::Queued);
        if already_queued {
            self.messages.mark_handled_by_agent(&message.id)?;
            debug!(
                "conversation already queued conversation_id={} message_id={}",
                conversation.id, message.id
            );
            return Ok(JobOutcome::AlreadyQueued);
        }

        let reason = match owner {
            MessageOwner::PlatformForcedHuman => "channel requires human handling",
            _ => "awaiting human agent",
        };
        let request = EscalationRequest::new(&conversation.id, EscalationType::General, reason)
            .with_actor(SYSTEM_ACTOR);
        let result = self.engine.escalate(&request)?;

        let ack = escalation_ack(&self.config.routing.escalation_ack, &result.outcome);
        self.deliver(conversation, &ack, json!({ "escalation": result.record.id }))?;
        self.messages.mark_handled_by_agent(&message.id)?;
        Ok(JobOutcome::Escalated(result.outcome))
    }

    /// Sends `text` to the conversation's customer and stores it with its
    /// delivery diagnostics.
    fn deliver(
        &self,
        conversation: &Conversation,
        text: &str,
        metadata: serde_json::Value,
    ) -> Result<SendOutcome, StoreError> {
        let adapter = self.registry.get(conversation.platform);
        let outcome = match &adapter {
            Some(adapter) => adapter.send(&conversation.external_conversation_id, text),
            None => SendOutcome::failed(format!("no adapter for {}", conversation.platform)),
        };
        let sender = adapter
            .as_ref()
            .and_then(|adapter| adapter.own_account_id().map(str::to_string))
            .unwrap_or_else(|| AI_ACTOR.to_string());

        let mut outbound = NewMessage::outbound(sender, text).with_metadata(metadata);
        outbound.external_id = outcome.external_id.clone();
        let stored = self.messages.append(&conversation.id, outbound)?;
        self.messages.record_delivery(&stored.message_id, &outcome)?;

        if outcome.ok {
            debug!(
                "reply delivered conversation_id={} platform={}",
                conversation.id, conversation.platform
            );
        } else {
            warn!(
                "reply delivery failed conversation_id={} platform={} status={:?}: {}",
                conversation.id,
                conversation.platform,
                outcome.status_code,
                outcome.error_detail.as_deref().unwrap_or("unknown error")
            );
        }
        Ok(outcome)
    }
}

impl JobHandler for Pipeline {
    fn handle(&self, job: &Job) -> Result<(), DispatchError> {
        let outcome = self.process_ai_job(job)?;
        debug!("job done job_id={} outcome={:?}", job.id, outcome);
        Ok(())
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("instance_id", &self.instance_id)
            .field("registry", &self.registry)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

fn turn_role(message: &Message) -> TurnRole {
    match message.direction {
        MessageDirection::Inbound => TurnRole::Customer,
        MessageDirection::System => TurnRole::System,
        MessageDirection::Outbound if message.sender_id.starts_with("agent:") => TurnRole::Agent,
        MessageDirection::Outbound => TurnRole::Assistant,
    }
}

/// Acknowledgment for a customer handed to humans, with the expected wait
/// when queued.
pub fn escalation_ack(base: &str, outcome: &EscalationOutcome) -> String {
    match outcome {
        EscalationOutcome::Assigned { .. } => {
            format!("{} An agent will reply shortly.", base.trim())
        }
        EscalationOutcome::Queued {
            estimated_wait_minutes,
            ..
        } => format!(
            "{} Estimated wait: about {} minutes.",
            base.trim(),
            estimated_wait_minutes
        ),
    }
}
