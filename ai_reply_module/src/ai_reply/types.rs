use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnRole {
    Customer,
    Assistant,
    Agent,
    System,
}

impl TurnRole {
    pub fn label(&self) -> &'static str {
        match self {
            TurnRole::Customer => "Customer",
            TurnRole::Assistant => "Assistant",
            TurnRole::Agent => "Agent",
            TurnRole::System => "System",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextTurn {
    pub role: TurnRole,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Everything the generation service sees for one reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplyRequest {
    pub conversation_id: String,
    pub platform: String,
    #[serde(default)]
    pub customer_name: Option<String>,
    pub turns: Vec<ContextTurn>,
    #[serde(default)]
    pub flow_summary: Option<String>,
    #[serde(default)]
    pub customer_data: Option<serde_json::Value>,
    pub latest_message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeneratedReply {
    pub text: String,
    pub confidence: f64,
    /// Set when the text is the canned fallback rather than a generated answer.
    #[serde(default)]
    pub fallback: bool,
}
