use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::channel::Platform;
use crate::flow::FlowState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    New,
    AiResponded,
    AgentAssigned,
    InProgress,
    Escalated,
    PendingCustomer,
    Resolved,
    Closed,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConversationStatus::New => "new",
            ConversationStatus::AiResponded => "ai_responded",
            ConversationStatus::AgentAssigned => "agent_assigned",
            ConversationStatus::InProgress => "in_progress",
            ConversationStatus::Escalated => "escalated",
            ConversationStatus::PendingCustomer => "pending_customer",
            ConversationStatus::Resolved => "resolved",
            ConversationStatus::Closed => "closed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ConversationStatus::Resolved | ConversationStatus::Closed)
    }
}

impl fmt::Display for ConversationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConversationStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "new" => Ok(ConversationStatus::New),
            "ai_responded" => Ok(ConversationStatus::AiResponded),
            "agent_assigned" => Ok(ConversationStatus::AgentAssigned),
            "in_progress" => Ok(ConversationStatus::InProgress),
            "escalated" => Ok(ConversationStatus::Escalated),
            "pending_customer" => Ok(ConversationStatus::PendingCustomer),
            "resolved" => Ok(ConversationStatus::Resolved),
            "closed" => Ok(ConversationStatus::Closed),
            other => Err(format!("unknown conversation status: {}", other)),
        }
    }
}

/// Per-conversation override for automated handling.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AiMode {
    #[default]
    Auto,
    On,
    Off,
}

impl AiMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AiMode::Auto => "auto",
            AiMode::On => "on",
            AiMode::Off => "off",
        }
    }
}

impl FromStr for AiMode {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "auto" => Ok(AiMode::Auto),
            "on" => Ok(AiMode::On),
            "off" => Ok(AiMode::Off),
            other => Err(format!("unknown ai mode: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub platform: Platform,
    pub external_conversation_id: String,
    pub status: ConversationStatus,
    pub ai_mode: AiMode,
    pub assigned_agent: Option<String>,
    pub escalated_agent: Option<String>,
    pub requires_human_intervention: bool,
    pub last_message_time: Option<DateTime<Utc>>,
    pub last_message_preview: Option<String>,
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
    pub flow_state: Option<FlowState>,
    pub escalation_reason: Option<String>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub escalated_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: i64,
}

impl Conversation {
    pub fn has_active_flow(&self) -> bool {
        self.flow_state.is_some()
    }

    /// Most recent activity, falling back to creation time for empty threads.
    pub fn last_activity(&self) -> DateTime<Utc> {
        self.last_message_time.unwrap_or(self.created_at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageDirection {
    Inbound,
    Outbound,
    System,
}

impl MessageDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageDirection::Inbound => "inbound",
            MessageDirection::Outbound => "outbound",
            MessageDirection::System => "system",
        }
    }
}

impl FromStr for MessageDirection {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "inbound" => Ok(MessageDirection::Inbound),
            "outbound" => Ok(MessageDirection::Outbound),
            "system" => Ok(MessageDirection::System),
            other => Err(format!("unknown message direction: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryStatus {
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

impl FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "sent" => Ok(DeliveryStatus::Sent),
            "failed" => Ok(DeliveryStatus::Failed),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub direction: MessageDirection,
    /// Normalized key; see `messages::normalize_external_id`.
    pub external_id: String,
    pub sender_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
    pub processed_by_ai: bool,
    pub ai_confidence: Option<f64>,
    pub requires_escalation: bool,
    pub handled_by_agent: bool,
    pub delivery_status: Option<DeliveryStatus>,
    pub delivery_detail: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Message about to be appended; content is immutable once stored.
#[derive(Debug, Clone, PartialEq)]
pub struct NewMessage {
    pub direction: MessageDirection,
    /// Platform id. Outbound and system messages without one get a derived key.
    pub external_id: Option<String>,
    pub sender_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub metadata: serde_json::Value,
}

impl NewMessage {
    pub fn inbound(
        external_id: impl Into<String>,
        sender_id: impl Into<String>,
        content: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            direction: MessageDirection::Inbound,
            external_id: Some(external_id.into()),
            sender_id: sender_id.into(),
            content: content.into(),
            timestamp,
            metadata: serde_json::Value::Null,
        }
    }

    pub fn outbound(sender_id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            direction: MessageDirection::Outbound,
            external_id: None,
            sender_id: sender_id.into(),
            content: content.into(),
            timestamp: Utc::now(),
            metadata: serde_json::Value::Null,
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationComment {
    pub id: String,
    pub conversation_id: String,
    pub author: String,
    pub body: String,
    pub created_at: DateTime<Utc>,
}
