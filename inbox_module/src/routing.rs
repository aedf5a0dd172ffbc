//! Who handles the next inbound message. Pure functions over snapshots;
//! the dispatcher applies the result.

use ai_reply_module::{ConfidenceGate, GateVerdict};
use serde::Serialize;

use crate::config::ChannelSettings;
use crate::conversation::{AiMode, Conversation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOwner {
    Ai,
    AssignedAgent,
    EscalationQueue,
    PlatformForcedHuman,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingDecision {
    /// An active flow consumes the message before any routing.
    AnswerFlow,
    Route(MessageOwner),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutingInput {
    pub has_active_flow: bool,
    pub ai_mode: AiMode,
    pub requires_human_intervention: bool,
    pub has_assigned_agent: bool,
    pub platform_human_only: bool,
}

impl RoutingInput {
    pub fn snapshot(conversation: &Conversation, channel: &ChannelSettings) -> Self {
        Self {
            has_active_flow: conversation.has_active_flow(),
            ai_mode: conversation.ai_mode,
            requires_human_intervention: conversation.requires_human_intervention,
            has_assigned_agent: conversation.assigned_agent.is_some(),
            platform_human_only: channel.human_only,
        }
    }
}

/// Rules in order: active flow, human override, platform policy, AI.
/// `AiMode::On` lets a conversation opt back into AI on a human-only platform.
pub fn decide(input: &RoutingInput) -> RoutingDecision {
    if input.has_active_flow {
        return RoutingDecision::AnswerFlow;
    }
    if input.ai_mode == AiMode::Off || input.requires_human_intervention {
        return RoutingDecision::Route(if input.has_assigned_agent {
            MessageOwner::AssignedAgent
        } else {
            MessageOwner::EscalationQueue
        });
    }
    if input.platform_human_only && input.ai_mode != AiMode::On {
        return RoutingDecision::Route(MessageOwner::PlatformForcedHuman);
    }
    RoutingDecision::Route(MessageOwner::Ai)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostReply {
    pub owner: MessageOwner,
    pub requires_escalation: bool,
}

/// Ownership after an AI reply. Low confidence hands the conversation to the
/// escalation queue whether or not the reply reached the customer.
pub fn after_ai_reply(gate: &ConfidenceGate, confidence: f64) -> PostReply {
    match gate.evaluate(confidence) {
        GateVerdict::Accept => PostReply {
            owner: MessageOwner::Ai,
            requires_escalation: false,
        },
        GateVerdict::Escalate => PostReply {
            owner: MessageOwner::EscalationQueue,
            requires_escalation: true,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input() -> RoutingInput {
        RoutingInput {
            has_active_flow: false,
            ai_mode: AiMode::Auto,
            requires_human_intervention: false,
            has_assigned_agent: false,
            platform_human_only: false,
        }
    }

    #[test]
    fn defaults_to_ai() {
        assert_eq!(decide(&input()), RoutingDecision::Route(MessageOwner::Ai));
    }

    #[test]
    fn active_flow_bypasses_everything() {
        let input = RoutingInput {
            has_active_flow: true,
            ai_mode: AiMode::Off,
            requires_human_intervention: true,
            platform_human_only: true,
            ..input()
        };
        assert_eq!(decide(&input), RoutingDecision::AnswerFlow);
    }

    #[test]
    fn human_override_prefers_assigned_agent() {
        let off = RoutingInput {
            ai_mode: AiMode::Off,
            ..input()
        };
        assert_eq!(
            decide(&off),
            RoutingDecision::Route(MessageOwner::EscalationQueue)
        );
        let assigned = RoutingInput {
            requires_human_intervention: true,
            has_assigned_agent: true,
            ..input()
        };
        assert_eq!(
            decide(&assigned),
            RoutingDecision::Route(MessageOwner::AssignedAgent)
        );
    }

    #[test]
    fn platform_policy_forces_human_unless_ai_forced_on() {
        let forced = RoutingInput {
            platform_human_only: true,
            ..input()
        };
        assert_eq!(
            decide(&forced),
            RoutingDecision::Route(MessageOwner::PlatformForcedHuman)
        );
        let opted_in = RoutingInput {
            ai_mode: AiMode::On,
            ..forced
        };
        assert_eq!(decide(&opted_in), RoutingDecision::Route(MessageOwner::Ai));
    }

    #[test]
    fn low_confidence_escalates() {
        let gate = ConfidenceGate::new(0.7);
        assert_eq!(
            after_ai_reply(&gate, 0.5),
            PostReply {
                owner: MessageOwner::EscalationQueue,
                requires_escalation: true
            }
        );
        assert_eq!(after_ai_reply(&gate, 0.7).owner, MessageOwner::Ai);
    }
}
