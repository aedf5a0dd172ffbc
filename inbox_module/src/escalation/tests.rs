use std::sync::{Arc, Mutex};
use std::thread;

use chrono::Utc;
use tempfile::TempDir;

use super::*;
use crate::channel::Platform;
use crate::collaborators::{AgentAlert, AgentNotifier, AlertKind, CollaboratorError, Collaborators};
use crate::config::EscalationConfig;
use crate::conversation::ConversationStatus;
use crate::directory::{ConversationDirectory, IdentityHints};
use crate::store::Database;

#[derive(Default)]
struct RecordingNotifier {
    alerts: Mutex<Vec<AgentAlert>>,
}

impl AgentNotifier for RecordingNotifier {
    fn notify(&self, alert: &AgentAlert) -> Result<(), CollaboratorError> {
        self.alerts.lock().expect("alerts lock").push(alert.clone());
        Ok(())
    }
}

struct Harness {
    _temp: TempDir,
    directory: ConversationDirectory,
    engine: EscalationEngine,
    notifier: Arc<RecordingNotifier>,
}

fn harness() -> Harness {
    let temp = TempDir::new().expect("tempdir");
    let db = Database::open(temp.path().join("inbox.db")).expect("open");
    let notifier = Arc::new(RecordingNotifier::default());
    let collaborators = Collaborators {
        notifier: notifier.clone(),
        ..Collaborators::default()
    };
    Harness {
        directory: ConversationDirectory::new(db.clone()),
        engine: EscalationEngine::new(db, EscalationConfig::default(), collaborators),
        notifier,
        _temp: temp,
    }
}

impl Harness {
    fn conversation(&self, external_id: &str) -> String {
        self.directory
            .resolve(Platform::WhatsApp, external_id, &IdentityHints::default(), false)
            .expect("resolve")
            .conversation_id
    }

    fn agent(&self, id: &str, department: &str, workload: i64, tags: &[&str]) {
        let mut agent = Agent::new(id, department);
        agent.max_concurrent = 10;
        agent.specializations = tags.iter().map(|t| t.to_string()).collect();
        self.engine.agents().upsert(&agent).expect("upsert");
        for _ in 0..workload {
            assert!(self.engine.agents().try_claim(id).expect("claim"));
        }
    }

    fn workload(&self, id: &str) -> i64 {
        self.engine
            .agents()
            .get(id)
            .expect("get")
            .expect("agent")
            .current_workload
    }
}

#[test]
fn assigns_agent_with_lighter_workload() {
    let h = harness();
    h.agent("busy", "claims_support", 5, &["claims"]);
    h.agent("light", "claims_support", 2, &["claims"]);
    let conversation_id = h.conversation("claim-1");

    let result = h
        .engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::Claims, "water damage"))
        .expect("escalate");

    assert_eq!(
        result.outcome,
        EscalationOutcome::Assigned {
            agent_id: "light".to_string()
        }
    );
    assert_eq!(h.workload("light"), 3);
    assert_eq!(h.workload("busy"), 5);

    let conversation = h.directory.require(&conversation_id).expect("load");
    assert_eq!(conversation.status, ConversationStatus::AgentAssigned);
    assert_eq!(conversation.assigned_agent.as_deref(), Some("light"));
    assert_eq!(conversation.escalated_agent.as_deref(), Some("light"));
    assert!(conversation.requires_human_intervention);
    assert_eq!(conversation.escalation_reason.as_deref(), Some("water damage"));
    assert_eq!(conversation.escalated_by.as_deref(), Some("system"));

    let alerts = h.notifier.alerts.lock().expect("alerts lock");
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].kind, AlertKind::Assigned);
    assert_eq!(alerts[0].agent_id.as_deref(), Some("light"));
}

#[test]
fn empty_department_queues_with_position_and_wait() {
    let h = harness();
    for n in 0..3 {
        let conversation_id = h.conversation(&format!("queued-{}", n));
        h.engine
            .escalate(&EscalationRequest::new(conversation_id, EscalationType::Claims, "claim"))
            .expect("escalate");
    }
    let conversation_id = h.conversation("fourth");
    let result = h
        .engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::Claims, "claim"))
        .expect("escalate");

    assert_eq!(
        result.outcome,
        EscalationOutcome::Queued {
            position: 4,
            estimated_wait_minutes: 50
        }
    );
    assert!(result.record.open);
    assert_eq!(h.engine.open_queue("claims_support").expect("queue").len(), 4);
    let conversation = h.directory.require(&conversation_id).expect("load");
    assert_eq!(conversation.status, ConversationStatus::Escalated);
    assert!(conversation.assigned_agent.is_none());
}

#[test]
fn requeueing_the_same_conversation_replaces_its_queue_entry() {
    let h = harness();
    let conversation_id = h.conversation("again");
    h.engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::General, "first"))
        .expect("escalate");
    let second = h
        .engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::General, "second"))
        .expect("escalate");
    assert_eq!(
        second.outcome,
        EscalationOutcome::Queued {
            position: 1,
            estimated_wait_minutes: 15
        }
    );
    let records = h.engine.records_for(&conversation_id).expect("records");
    assert_eq!(records.len(), 2);
    assert!(!records[0].open);
    assert!(records[1].open);
}

#[test]
fn terminating_releases_workload_and_queue_entries() {
    let h = harness();
    h.agent("agent-1", "customer_support", 0, &[]);
    let assigned = h.conversation("assigned");
    h.engine
        .escalate(&EscalationRequest::new(&assigned, EscalationType::General, "help"))
        .expect("escalate");
    assert_eq!(h.workload("agent-1"), 1);

    h.directory
        .terminate(&assigned, ConversationStatus::Resolved)
        .expect("resolve");
    assert_eq!(h.workload("agent-1"), 0);
    h.directory
        .terminate(&assigned, ConversationStatus::Closed)
        .expect("second terminate");
    assert_eq!(h.workload("agent-1"), 0);

    let queued = h.conversation("queued");
    h.engine
        .escalate(&EscalationRequest::new(&queued, EscalationType::Billing, "refund"))
        .expect("escalate");
    assert_eq!(h.engine.open_queue("billing_support").expect("queue").len(), 1);
    h.directory
        .terminate(&queued, ConversationStatus::Closed)
        .expect("close");
    assert!(h.engine.open_queue("billing_support").expect("queue").is_empty());
}

#[test]
fn reassignment_moves_to_another_agent_and_leaves_audit_comment() {
    let h = harness();
    h.agent("first", "technical_support", 0, &["technical"]);
    let conversation_id = h.conversation("tech");
    h.engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::Technical, "router down"))
        .expect("escalate");
    h.agent("second", "technical_support", 4, &["technical"]);
    h.engine
        .agents()
        .set_status("first", AgentStatus::Offline)
        .expect("status");

    let result = h
        .engine
        .reassign(&conversation_id, "agent offline", Utc::now())
        .expect("reassign")
        .expect("had an agent");

    assert_eq!(
        result.outcome,
        EscalationOutcome::Assigned {
            agent_id: "second".to_string()
        }
    );
    assert_eq!(h.workload("first"), 0);
    assert_eq!(h.workload("second"), 5);
    let comments = h.directory.comments(&conversation_id).expect("comments");
    assert_eq!(comments.len(), 1);
    assert!(comments[0].body.contains("first"));
    let alerts = h.notifier.alerts.lock().expect("alerts lock");
    assert!(alerts.iter().any(|a| a.kind == AlertKind::Reassigned));
}

#[test]
fn reassignment_without_candidates_queues() {
    let h = harness();
    h.agent("only", "customer_support", 0, &[]);
    let conversation_id = h.conversation("solo");
    h.engine
        .escalate(&EscalationRequest::new(&conversation_id, EscalationType::General, "help"))
        .expect("escalate");
    h.engine.agents().set_enabled("only", false).expect("disable");

    let result = h
        .engine
        .reassign(&conversation_id, "agent disabled", Utc::now())
        .expect("reassign")
        .expect("had an agent");
    assert!(matches!(result.outcome, EscalationOutcome::Queued { position: 1, .. }));
    assert_eq!(h.workload("only"), 0);
    let conversation = h.directory.require(&conversation_id).expect("load");
    assert!(conversation.assigned_agent.is_none());
    assert_eq!(conversation.status, ConversationStatus::Escalated);
}

#[test]
fn queue_drain_assigns_oldest_first() {
    let h = harness();
    let first = h.conversation("q-1");
    let second = h.conversation("q-2");
    for id in [&first, &second] {
        h.engine
            .escalate(&EscalationRequest::new(id.as_str(), EscalationType::Complaint, "late delivery"))
            .expect("escalate");
    }
    let mut agent = Agent::new("relations", "customer_relations");
    agent.max_concurrent = 1;
    h.engine.agents().upsert(&agent).expect("upsert");

    assert_eq!(h.engine.drain_queue(Utc::now()).expect("drain"), 1);
    assert_eq!(
        h.directory.require(&first).expect("load").assigned_agent.as_deref(),
        Some("relations")
    );
    assert!(h.directory.require(&second).expect("load").assigned_agent.is_none());
    assert_eq!(h.engine.open_queue("customer_relations").expect("queue").len(), 1);
}

#[test]
fn concurrent_escalations_respect_agent_capacity() {
    let h = harness();
    let mut agent = Agent::new("solo", "customer_support");
    agent.max_concurrent = 2;
    h.engine.agents().upsert(&agent).expect("upsert");
    let conversations: Vec<String> = (0..6).map(|n| h.conversation(&format!("c-{}", n))).collect();

    let handles: Vec<_> = conversations
        .into_iter()
        .map(|conversation_id| {
            let engine = h.engine.clone();
            thread::spawn(move || {
                engine
                    .escalate(&EscalationRequest::new(conversation_id, EscalationType::General, "help"))
                    .expect("escalate")
            })
        })
        .collect();
    let assigned = handles
        .into_iter()
        .map(|handle| handle.join().expect("join"))
        .filter(|result| matches!(result.outcome, EscalationOutcome::Assigned { .. }))
        .count();

    assert_eq!(assigned, 2);
    assert_eq!(h.workload("solo"), 2);
    assert_eq!(h.engine.open_queue("customer_support").expect("queue").len(), 4);
}

#[test]
fn assignment_time_is_recorded_with_the_commit() {
    use chrono::TimeZone;

    let h = harness();
    h.agent("agent-1", "customer_support", 0, &[]);
    let conversation_id = h.conversation("rotation-1");
    let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();

    h.engine
        .escalate_at(
            &EscalationRequest::new(&conversation_id, EscalationType::General, "help"),
            at,
        )
        .expect("escalate");

    let agent = h.engine.agents().get("agent-1").expect("get").expect("agent");
    assert_eq!(agent.last_assignment, Some(at));
}
