mod test_support;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use inbox_module::ingest::{STATUS_ACCEPTED, STATUS_DUPLICATE};
use inbox_module::{Message, MessageDirection, Platform, RouterConfig};
use test_support::*;

const OTHER_PROCESS: &str = "other-process:job";

fn stored(harness: &Harness, external_id: &str) -> Message {
    harness
        .messages()
        .find_by_external_id(external_id)
        .expect("find message")
        .expect("message stored")
}

fn outbound_count(harness: &Harness, conversation_id: &str) -> usize {
    harness
        .thread(conversation_id)
        .iter()
        .filter(|message| message.direction == MessageDirection::Outbound)
        .count()
}

fn with_lease_secs(mut config: RouterConfig, secs: i64) -> RouterConfig {
    config.dispatch.lease_secs = secs;
    config
}

#[test]
fn redelivery_requeues_a_message_whose_job_gave_up() {
    let harness = Harness::start(with_lease_secs(base_config(UNREACHABLE_API), 1));
    harness
        .post_whatsapp(&whatsapp_text("15557770000", "wamid.L1", "hi"))
        .expect("first message");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15557770000");

    let lease = harness
        .db
        .try_acquire_lease(&conversation.id, OTHER_PROCESS, chrono::Duration::seconds(60))
        .expect("acquire")
        .expect("lease free");

    let body = whatsapp_text("15557770000", "wamid.L2", "still there?");
    let ack = harness.post_whatsapp(&body).expect("second message");
    assert_eq!(ack.status, STATUS_ACCEPTED);
    let waiting = stored(&harness, "wamid.L2");
    assert!(!waiting.processed_by_ai);
    assert_eq!(harness.generator.requests().len(), 1);

    lease.release().expect("release");
    let ack = harness.post_whatsapp(&body).expect("redelivery");
    assert_eq!(ack.status, STATUS_DUPLICATE);

    let answered = stored(&harness, "wamid.L2");
    assert!(answered.processed_by_ai);
    assert_eq!(harness.generator.requests().len(), 2);
    assert_eq!(outbound_count(&harness, &conversation.id), 2);

    // Once answered, further redeliveries stay silent.
    harness.post_whatsapp(&body).expect("third delivery");
    assert_eq!(harness.generator.requests().len(), 2);
    assert_eq!(outbound_count(&harness, &conversation.id), 2);
}

#[test]
fn job_waits_out_a_stale_lease() {
    let harness = Harness::start(with_lease_secs(base_config(UNREACHABLE_API), 5));
    harness
        .post_whatsapp(&whatsapp_text("15557770001", "wamid.S1", "hi"))
        .expect("first message");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15557770001");

    // Held by a process that never releases it.
    let _stale = harness
        .db
        .try_acquire_lease(&conversation.id, OTHER_PROCESS, chrono::Duration::seconds(1))
        .expect("acquire")
        .expect("lease free");

    let ack = harness
        .post_whatsapp(&whatsapp_text("15557770001", "wamid.S2", "hello again"))
        .expect("second message");
    assert_eq!(ack.status, STATUS_ACCEPTED);
    assert!(stored(&harness, "wamid.S2").processed_by_ai);
    assert_eq!(outbound_count(&harness, &conversation.id), 2);
}

#[test]
fn concurrent_messages_in_one_conversation_are_answered_one_at_a_time() {
    let generator = ScriptedGenerator::confident("On it.").delayed(Duration::from_millis(400));
    let harness = Harness::with_generator(base_config(UNREACHABLE_API), generator);
    harness
        .post_whatsapp(&whatsapp_text("15557770002", "wamid.C0", "hi"))
        .expect("opening message");
    let conversation = harness.only_conversation(Platform::WhatsApp, "15557770002");

    let barrier = Arc::new(Barrier::new(2));
    let handles: Vec<_> = ["wamid.C1", "wamid.C2"]
        .into_iter()
        .map(|message_id| {
            let state = harness.state.clone();
            let barrier = barrier.clone();
            let body = whatsapp_text("15557770002", message_id, "any update?");
            thread::spawn(move || {
                barrier.wait();
                state
                    .ingest()
                    .handle("whatsapp", &whatsapp_headers(&body), body.as_bytes())
            })
        })
        .collect();
    for handle in handles {
        let ack = handle.join().expect("join").expect("delivery");
        assert_eq!(ack.status, STATUS_ACCEPTED);
    }

    for external_id in ["wamid.C0", "wamid.C1", "wamid.C2"] {
        assert!(
            stored(&harness, external_id).processed_by_ai,
            "{} was not answered",
            external_id
        );
    }
    assert_eq!(harness.generator.requests().len(), 3);
    assert_eq!(harness.generator.max_in_flight(), 1);
    assert_eq!(outbound_count(&harness, &conversation.id), 3);
}
