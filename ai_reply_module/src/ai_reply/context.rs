use std::fmt::Write as _;

use super::constants::{MAX_TURN_CHARS, SYSTEM_PROMPT};
use super::types::{ContextTurn, ReplyRequest};

/// Orders turns by timestamp and keeps the most recent `max_turns`.
///
/// Callers may hand over turns in any order (different stores, retries); the
/// generation service always sees them oldest first.
pub fn build_context(mut turns: Vec<ContextTurn>, max_turns: usize) -> Vec<ContextTurn> {
    turns.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
    if turns.len() > max_turns {
        turns.drain(..turns.len() - max_turns);
    }
    for turn in &mut turns {
        turn.text = truncate_chars(turn.text.trim(), MAX_TURN_CHARS);
    }
    turns
}

pub fn build_prompt(request: &ReplyRequest) -> String {
    let mut prompt = String::from(SYSTEM_PROMPT);
    prompt.push('\n');
    let _ = writeln!(prompt, "Channel: {}", request.platform);
    if let Some(name) = request.customer_name.as_deref().filter(|v| !v.trim().is_empty()) {
        let _ = writeln!(prompt, "Customer: {}", name.trim());
    }
    if let Some(flow) = request.flow_summary.as_deref() {
        let _ = writeln!(prompt, "Active flow: {}", flow);
    }
    if let Some(data) = request.customer_data.as_ref() {
        let _ = writeln!(prompt, "Customer data: {}", data);
    }

    prompt.push_str("\nConversation:\n");
    for turn in &request.turns {
        let _ = writeln!(prompt, "{}: {}", turn.role.label(), turn.text);
    }
    let _ = writeln!(prompt, "\nReply to the latest customer message: {}", request.latest_message);
    prompt
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    match value.char_indices().nth(max_chars) {
        Some((idx, _)) => format!("{}…", &value[..idx]),
        None => value.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai_reply::types::TurnRole;
    use chrono::{Duration, Utc};

    fn turn(role: TurnRole, text: &str, offset_secs: i64) -> ContextTurn {
        ContextTurn {
            role,
            text: text.to_string(),
            timestamp: Utc::now() + Duration::seconds(offset_secs),
        }
    }

    #[test]
    fn context_is_sorted_and_limited() {
        let turns = vec![
            turn(TurnRole::Customer, "third", 30),
            turn(TurnRole::Customer, "first", 10),
            turn(TurnRole::Assistant, "second", 20),
            turn(TurnRole::Customer, "fourth", 40),
        ];

        let context = build_context(turns, 3);
        let texts: Vec<_> = context.iter().map(|t| t.text.as_str()).collect();
        assert_eq!(texts, vec!["second", "third", "fourth"]);
    }

    #[test]
    fn long_turns_are_truncated_on_char_boundary() {
        let long = "é".repeat(MAX_TURN_CHARS + 10);
        let context = build_context(vec![turn(TurnRole::Customer, &long, 0)], 5);
        assert_eq!(context[0].text.chars().count(), MAX_TURN_CHARS + 1);
        assert!(context[0].text.ends_with('…'));
    }

    #[test]
    fn prompt_lists_transcript_and_customer() {
        let request = ReplyRequest {
            conversation_id: "conv-1".to_string(),
            platform: "whatsapp".to_string(),
            customer_name: Some("Dana".to_string()),
            turns: vec![
                turn(TurnRole::Customer, "Where is my order?", 0),
                turn(TurnRole::Assistant, "Let me check.", 5),
            ],
            flow_summary: None,
            customer_data: Some(serde_json::json!({"plan": "gold"})),
            latest_message: "Where is my order?".to_string(),
        };

        let prompt = build_prompt(&request);
        assert!(prompt.contains("Channel: whatsapp"));
        assert!(prompt.contains("Customer: Dana"));
        assert!(prompt.contains("Customer: Where is my order?"));
        assert!(prompt.contains("Assistant: Let me check."));
        assert!(prompt.contains("\"plan\":\"gold\""));
    }
}
