mod test_support;

use chrono::{Duration, Utc};
use inbox_module::collaborators::AlertKind;
use inbox_module::escalation::{AgentStatus, EscalationType, RecordOutcome};
use inbox_module::sweeps::Sweeper;
use inbox_module::{ConversationStatus, Platform, RouterConfig};
use test_support::*;

fn sweeper(harness: &Harness) -> Sweeper {
    Sweeper::new(harness.db.clone(), harness.engine().clone())
}

fn human_only(mut config: RouterConfig) -> RouterConfig {
    let mut whatsapp = config.channel(Platform::WhatsApp);
    whatsapp.human_only = true;
    config.set_channel(Platform::WhatsApp, whatsapp);
    config
}

#[test]
fn idle_conversations_escalate_to_supervisors() {
    let harness = Harness::start(base_config(UNREACHABLE_API));
    harness.add_agent("lead-1", "supervisors");
    harness
        .post_whatsapp(&whatsapp_text("15554440000", "wamid.I1", "hello"))
        .expect("deliver");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15554440000");
    assert_eq!(conversation.status, ConversationStatus::AiResponded);

    let sweeper = sweeper(&harness);
    let soon = sweeper.run_once(Utc::now() + Duration::hours(1));
    assert_eq!(soon.inactive_escalated, 0);

    let report = sweeper.run_once(Utc::now() + Duration::hours(25));
    assert_eq!(report.inactive_escalated, 1);

    let conversation = harness.directory().require(&conversation.id).expect("load");
    assert_eq!(conversation.assigned_agent.as_deref(), Some("lead-1"));
    assert!(conversation.requires_human_intervention);
    let records = harness.engine().records_for(&conversation.id).expect("records");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].escalation_type, EscalationType::Inactivity);
    assert_eq!(records[0].department, "supervisors");
    assert_eq!(records[0].actor, "system");

    // Already escalated: a later sweep leaves it alone.
    let again = sweeper.run_once(Utc::now() + Duration::hours(50));
    assert_eq!(again.inactive_escalated, 0);
}

#[test]
fn conversations_move_off_offline_agents() {
    let harness = Harness::start(human_only(base_config(UNREACHABLE_API)));
    harness.add_agent("agent-a", "customer_support");
    harness
        .post_whatsapp(&whatsapp_text("15554440001", "wamid.R1", "need help"))
        .expect("deliver");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15554440001");
    assert_eq!(conversation.assigned_agent.as_deref(), Some("agent-a"));

    harness.add_agent("agent-b", "customer_support");
    harness
        .engine()
        .agents()
        .set_status("agent-a", AgentStatus::Offline)
        .expect("go offline");

    let report = sweeper(&harness).run_once(Utc::now());
    assert_eq!(report.reassigned, 1);

    let conversation = harness.directory().require(&conversation.id).expect("load");
    assert_eq!(conversation.assigned_agent.as_deref(), Some("agent-b"));
    let workload = |id: &str| {
        harness
            .engine()
            .agents()
            .get(id)
            .expect("get agent")
            .expect("agent")
            .current_workload
    };
    assert_eq!(workload("agent-a"), 0);
    assert_eq!(workload("agent-b"), 1);

    let comments = harness.directory().comments(&conversation.id).expect("comments");
    assert!(comments
        .iter()
        .any(|comment| comment.body.starts_with("Reassigned from agent agent-a")));
    assert!(harness
        .notifier
        .alerts()
        .iter()
        .any(|alert| alert.kind == AlertKind::Reassigned
            && alert.agent_id.as_deref() == Some("agent-b")));
}

#[test]
fn queued_conversations_are_assigned_when_an_agent_appears() {
    let harness = Harness::start(human_only(base_config(UNREACHABLE_API)));
    harness
        .post_whatsapp(&whatsapp_text("15554440002", "wamid.Q1", "anyone?"))
        .expect("deliver");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15554440002");
    assert_eq!(conversation.status, ConversationStatus::Escalated);

    let sweeper = sweeper(&harness);
    assert_eq!(sweeper.run_once(Utc::now()).drained, 0);

    harness.add_agent("agent-late", "customer_support");
    assert_eq!(sweeper.run_once(Utc::now()).drained, 1);

    let conversation = harness.directory().require(&conversation.id).expect("load");
    assert_eq!(conversation.assigned_agent.as_deref(), Some("agent-late"));
    assert_eq!(conversation.status, ConversationStatus::AgentAssigned);
    let records = harness.engine().records_for(&conversation.id).expect("records");
    assert!(records
        .iter()
        .all(|record| !(record.open && record.outcome == RecordOutcome::Queued)));
}
