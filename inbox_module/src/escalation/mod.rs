//! Escalation rules, agent scoring and assignment.

mod agents;
mod engine;
mod rules;
mod scoring;
mod types;

pub use agents::AgentStore;
pub use engine::EscalationEngine;
pub use rules::configure;
pub use scoring::{is_candidate, rank_candidates, score};
pub use types::{
    Agent, AgentStatus, ContactMethod, EscalationOutcome, EscalationPlan, EscalationRecord,
    EscalationRequest, EscalationResult, EscalationType, Priority, RecordOutcome, RequesterRole,
    WorkingHours,
};

#[cfg(test)]
mod tests;
