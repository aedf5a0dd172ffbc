use std::cmp::Ordering;

use chrono::{DateTime, Utc};

use super::types::{Agent, AgentStatus, EscalationPlan, Priority};

const MAX_WORKLOAD_POINTS: i64 = 10;
const SPECIALIZATION_BONUS: i64 = 20;
const AVAILABILITY_BONUS: i64 = 5;
const URGENT_BONUS: i64 = 10;

/// `(10 - workload) * 2`, plus 20 for a matching specialization, 5 for being
/// available, and 10 when the escalation is urgent.
pub fn score(agent: &Agent, plan: &EscalationPlan) -> i64 {
    let mut score = (MAX_WORKLOAD_POINTS - agent.current_workload) * 2;
    if plan
        .specialization
        .as_deref()
        .is_some_and(|tag| agent.has_specialization(tag))
    {
        score += SPECIALIZATION_BONUS;
    }
    score += AVAILABILITY_BONUS;
    if plan.priority == Priority::Urgent {
        score += URGENT_BONUS;
    }
    score
}

pub fn is_candidate(agent: &Agent, plan: &EscalationPlan, now: DateTime<Utc>) -> bool {
    if !agent.enabled || agent.status != AgentStatus::Available || !agent.is_on_shift(now) {
        return false;
    }
    if agent.current_workload >= agent.max_concurrent {
        return false;
    }
    if plan.specialist_required {
        return plan
            .specialization
            .as_deref()
            .map_or(true, |tag| agent.has_specialization(tag));
    }
    true
}

/// Eligible agents, best first. Ties go to whoever was assigned least
/// recently (never-assigned first), then to the lowest id.
pub fn rank_candidates(
    agents: Vec<Agent>,
    plan: &EscalationPlan,
    now: DateTime<Utc>,
    exclude: Option<&str>,
) -> Vec<(Agent, i64)> {
    let mut ranked: Vec<(Agent, i64)> = agents
        .into_iter()
        .filter(|agent| exclude != Some(agent.id.as_str()))
        .filter(|agent| is_candidate(agent, plan, now))
        .map(|agent| {
            let score = score(&agent, plan);
            (agent, score)
        })
        .collect();
    ranked.sort_by(|(a, a_score), (b, b_score)| {
        b_score
            .cmp(a_score)
            .then_with(|| compare_last_assignment(a.last_assignment, b.last_assignment))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

fn compare_last_assignment(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(a), Some(b)) => a.cmp(&b),
    }
}
