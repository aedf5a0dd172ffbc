use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

macro_rules! labeled_enum {
    ($name:ident { $($variant:ident => $label:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $label,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = String;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value.trim().to_ascii_lowercase().as_str() {
                    $($label => Ok($name::$variant),)+
                    other => Err(format!("unknown {}: {}", stringify!($name), other)),
                }
            }
        }
    };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EscalationType {
    General,
    Technical,
    Billing,
    Claims,
    Dispute,
    Complaint,
    LowConfidence,
    Inactivity,
}

labeled_enum!(EscalationType {
    General => "general",
    Technical => "technical",
    Billing => "billing",
    Claims => "claims",
    Dispute => "dispute",
    Complaint => "complaint",
    LowConfidence => "low_confidence",
    Inactivity => "inactivity",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequesterRole {
    Customer,
    Agent,
    Partner,
    Vip,
}

labeled_enum!(RequesterRole {
    Customer => "customer",
    Agent => "agent",
    Partner => "partner",
    Vip => "vip",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    Low,
    Normal,
    High,
    Urgent,
}

labeled_enum!(Priority {
    Low => "low",
    Normal => "normal",
    High => "high",
    Urgent => "urgent",
});

impl Priority {
    const ORDER: [Priority; 4] = [Priority::Low, Priority::Normal, Priority::High, Priority::Urgent];

    /// Raises the priority by `steps` levels, stopping at `Urgent`.
    pub fn boosted(self, steps: u8) -> Priority {
        let index = Self::ORDER
            .iter()
            .position(|p| *p == self)
            .unwrap_or(0)
            .saturating_add(steps as usize)
            .min(Self::ORDER.len() - 1);
        Self::ORDER[index]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContactMethod {
    Chat,
    Email,
    Phone,
}

labeled_enum!(ContactMethod {
    Chat => "chat",
    Email => "email",
    Phone => "phone",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Away,
    Offline,
}

labeled_enum!(AgentStatus {
    Available => "available",
    Busy => "busy",
    Away => "away",
    Offline => "offline",
});

/// Where and how fast an escalation must be handled.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EscalationPlan {
    pub escalation_type: EscalationType,
    pub department: String,
    pub target_response_minutes: i64,
    pub contact_method: ContactMethod,
    pub specialist_required: bool,
    pub priority_boost: u8,
    /// Effective priority after the boost.
    pub priority: Priority,
    pub specialization: Option<String>,
}

/// Daily availability window in UTC hours. `start == end` means all day;
/// `start > end` wraps past midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl WorkingHours {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let hour = at.hour();
        match self.start_hour.cmp(&self.end_hour) {
            std::cmp::Ordering::Equal => true,
            std::cmp::Ordering::Less => hour >= self.start_hour && hour < self.end_hour,
            std::cmp::Ordering::Greater => hour >= self.start_hour || hour < self.end_hour,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    pub department: String,
    pub current_workload: i64,
    pub max_concurrent: i64,
    pub status: AgentStatus,
    pub specializations: Vec<String>,
    pub last_assignment: Option<DateTime<Utc>>,
    pub working_hours: Option<WorkingHours>,
    pub enabled: bool,
}

impl Agent {
    pub fn new(id: impl Into<String>, department: impl Into<String>) -> Self {
        let id = id.into();
        Self {
            name: id.clone(),
            id,
            department: department.into(),
            current_workload: 0,
            max_concurrent: 5,
            status: AgentStatus::Available,
            specializations: Vec::new(),
            last_assignment: None,
            working_hours: None,
            enabled: true,
        }
    }

    pub fn has_specialization(&self, tag: &str) -> bool {
        self.specializations
            .iter()
            .any(|candidate| candidate.eq_ignore_ascii_case(tag))
    }

    pub fn is_on_shift(&self, at: DateTime<Utc>) -> bool {
        self.working_hours.map_or(true, |hours| hours.contains(at))
    }

    /// Whether the agent can keep the conversations already assigned to them.
    pub fn is_reachable(&self, at: DateTime<Utc>) -> bool {
        self.enabled && self.status == AgentStatus::Available && self.is_on_shift(at)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordOutcome {
    Assigned,
    Queued,
}

labeled_enum!(RecordOutcome {
    Assigned => "assigned",
    Queued => "queued",
});

/// Audit row for one escalation attempt. Rows are never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EscalationRecord {
    pub id: String,
    pub conversation_id: String,
    pub escalation_type: EscalationType,
    pub requester_role: RequesterRole,
    pub priority: Priority,
    pub department: String,
    pub outcome: RecordOutcome,
    pub assigned_agent: Option<String>,
    pub queue_position: Option<i64>,
    pub estimated_wait_minutes: Option<i64>,
    pub target_response_minutes: i64,
    pub contact_method: ContactMethod,
    pub reason: String,
    pub actor: String,
    /// Queued records stay open until assigned or the conversation terminates.
    pub open: bool,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EscalationRequest {
    pub conversation_id: String,
    pub escalation_type: EscalationType,
    pub requester_role: RequesterRole,
    pub priority: Priority,
    pub reason: String,
    pub actor: String,
    /// Routes to this department instead of the rule table's.
    pub department: Option<String>,
    /// Agent that must not receive the conversation (reassignment).
    pub exclude_agent: Option<String>,
}

impl EscalationRequest {
    pub fn new(
        conversation_id: impl Into<String>,
        escalation_type: EscalationType,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            escalation_type,
            requester_role: RequesterRole::Customer,
            priority: Priority::Normal,
            reason: reason.into(),
            actor: "system".to_string(),
            department: None,
            exclude_agent: None,
        }
    }

    pub fn with_role(mut self, role: RequesterRole) -> Self {
        self.requester_role = role;
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn with_department(mut self, department: impl Into<String>) -> Self {
        self.department = Some(department.into());
        self
    }

    pub fn excluding(mut self, agent_id: impl Into<String>) -> Self {
        self.exclude_agent = Some(agent_id.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum EscalationOutcome {
    Assigned {
        agent_id: String,
    },
    Queued {
        position: i64,
        estimated_wait_minutes: i64,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct EscalationResult {
    pub plan: EscalationPlan,
    pub outcome: EscalationOutcome,
    pub record: EscalationRecord,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn priority_boost_saturates_at_urgent() {
        assert_eq!(Priority::Low.boosted(1), Priority::Normal);
        assert_eq!(Priority::Normal.boosted(2), Priority::Urgent);
        assert_eq!(Priority::High.boosted(5), Priority::Urgent);
        assert_eq!(Priority::Urgent.boosted(0), Priority::Urgent);
        assert!(Priority::Low < Priority::Urgent);
    }

    #[test]
    fn working_hours_handle_overnight_windows() {
        let at = |hour| Utc.with_ymd_and_hms(2024, 1, 1, hour, 30, 0).unwrap();
        let day = WorkingHours {
            start_hour: 9,
            end_hour: 17,
        };
        assert!(day.contains(at(9)));
        assert!(!day.contains(at(17)));
        let night = WorkingHours {
            start_hour: 22,
            end_hour: 6,
        };
        assert!(night.contains(at(23)));
        assert!(night.contains(at(2)));
        assert!(!night.contains(at(12)));
    }

    #[test]
    fn labels_parse_back() {
        assert_eq!(
            "low_confidence".parse::<EscalationType>(),
            Ok(EscalationType::LowConfidence)
        );
        assert_eq!("VIP".parse::<RequesterRole>(), Ok(RequesterRole::Vip));
        assert!("sometimes".parse::<AgentStatus>().is_err());
    }
}
