use super::types::{ContactMethod, EscalationPlan, EscalationType, Priority, RequesterRole};
use crate::config::DEFAULT_SUPERVISOR_DEPARTMENT;

struct Rule {
    department: &'static str,
    target_response_minutes: i64,
    contact_method: ContactMethod,
    specialist_required: bool,
    priority_boost: u8,
    specialization: Option<&'static str>,
}

fn rule_for(escalation_type: EscalationType) -> Rule {
    match escalation_type {
        EscalationType::General => Rule {
            department: "customer_support",
            target_response_minutes: 60,
            contact_method: ContactMethod::Chat,
            specialist_required: false,
            priority_boost: 0,
            specialization: None,
        },
        EscalationType::Technical => Rule {
            department: "technical_support",
            target_response_minutes: 120,
            contact_method: ContactMethod::Chat,
            specialist_required: true,
            priority_boost: 0,
            specialization: Some("technical"),
        },
        EscalationType::Billing => Rule {
            department: "billing_support",
            target_response_minutes: 60,
            contact_method: ContactMethod::Email,
            specialist_required: false,
            priority_boost: 0,
            specialization: Some("billing"),
        },
        EscalationType::Claims => Rule {
            department: "claims_support",
            target_response_minutes: 240,
            contact_method: ContactMethod::Phone,
            specialist_required: true,
            priority_boost: 1,
            specialization: Some("claims"),
        },
        EscalationType::Dispute => Rule {
            department: "claims_support",
            target_response_minutes: 60,
            contact_method: ContactMethod::Phone,
            specialist_required: true,
            priority_boost: 2,
            specialization: Some("disputes"),
        },
        EscalationType::Complaint => Rule {
            department: "customer_relations",
            target_response_minutes: 30,
            contact_method: ContactMethod::Phone,
            specialist_required: false,
            priority_boost: 1,
            specialization: Some("complaints"),
        },
        EscalationType::LowConfidence => Rule {
            department: "customer_support",
            target_response_minutes: 30,
            contact_method: ContactMethod::Chat,
            specialist_required: false,
            priority_boost: 0,
            specialization: None,
        },
        EscalationType::Inactivity => Rule {
            department: DEFAULT_SUPERVISOR_DEPARTMENT,
            target_response_minutes: 30,
            contact_method: ContactMethod::Chat,
            specialist_required: false,
            priority_boost: 0,
            specialization: None,
        },
    }
}

/// Looks up the escalation rule and tightens it for the requester's role.
pub fn configure(
    escalation_type: EscalationType,
    requester_role: RequesterRole,
    priority: Priority,
) -> EscalationPlan {
    let rule = rule_for(escalation_type);
    let mut target_response_minutes = rule.target_response_minutes;
    let mut priority_boost = rule.priority_boost;

    if matches!(requester_role, RequesterRole::Vip | RequesterRole::Partner) {
        target_response_minutes = (target_response_minutes / 2).max(1);
    }
    if requester_role == RequesterRole::Vip && escalation_type == EscalationType::Dispute {
        priority_boost = priority_boost.saturating_add(1);
    }

    EscalationPlan {
        escalation_type,
        department: rule.department.to_string(),
        target_response_minutes,
        contact_method: rule.contact_method,
        specialist_required: rule.specialist_required,
        priority_boost,
        priority: priority.boosted(priority_boost),
        specialization: rule.specialization.map(str::to_string),
    }
}
