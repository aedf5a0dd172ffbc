#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use ai_reply_module::{GeneratedReply, ReplyError, ReplyGenerator, ReplyRequest};
use axum::http::{HeaderMap, HeaderValue};
use hmac::{Hmac, Mac};
use inbox_module::collaborators::{AgentAlert, AgentNotifier, CollaboratorError, Collaborators};
use inbox_module::directory::ConversationDirectory;
use inbox_module::escalation::{Agent, EscalationEngine};
use inbox_module::messages::MessageStore;
use inbox_module::service::{start_runtime, GatewayState, RuntimeControl};
use inbox_module::{
    ChannelSettings, Conversation, Database, IngestError, Message, Platform, RouterConfig,
    WebhookAck,
};
use sha2::Sha256;
use tempfile::TempDir;

pub const WHATSAPP_SECRET: &str = "wa-app-secret";
pub const WHATSAPP_VERIFY_TOKEN: &str = "wa-verify-token";
pub const WHATSAPP_PHONE_ID: &str = "PHONE_NUMBER_ID";
pub const WHATSAPP_BUSINESS_NUMBER: &str = "15550001111";
pub const LIVECHAT_SECRET: &str = "widget-secret";

/// Nothing listens here, so sends fail fast instead of leaving the machine.
pub const UNREACHABLE_API: &str = "http://127.0.0.1:9";

pub fn start_mockito_server(test_name: &str) -> Option<mockito::ServerGuard> {
    let server = std::panic::catch_unwind(|| mockito::Server::new());
    match server {
        Ok(server) => Some(server),
        Err(_) => {
            eprintln!(
                "Skipping {test_name}; unable to start mockito server in this environment."
            );
            None
        }
    }
}

/// Inline dispatch plus signed WhatsApp and live-chat channels pointed at `api_base`.
pub fn base_config(api_base: &str) -> RouterConfig {
    let mut config = RouterConfig::default();
    config.dispatch.workers = 0;
    config.dispatch.retry_backoff_ms = 1;
    config.ai.timeout_secs = 5;
    config.set_channel(
        Platform::WhatsApp,
        ChannelSettings {
            secret: Some(WHATSAPP_SECRET.to_string()),
            verify_token: Some(WHATSAPP_VERIFY_TOKEN.to_string()),
            access_token: Some("wa-access-token".to_string()),
            account_id: Some(WHATSAPP_PHONE_ID.to_string()),
            sender_address: Some(WHATSAPP_BUSINESS_NUMBER.to_string()),
            api_base_url: Some(api_base.to_string()),
            send_timeout_secs: 2,
            ..ChannelSettings::default()
        },
    );
    config.set_channel(
        Platform::LiveChat,
        ChannelSettings {
            secret: Some(LIVECHAT_SECRET.to_string()),
            api_base_url: Some(api_base.to_string()),
            send_timeout_secs: 2,
            ..ChannelSettings::default()
        },
    );
    config
}

/// Replies from a script, then repeats `default` once the script runs out.
pub struct ScriptedGenerator {
    script: Mutex<VecDeque<Result<GeneratedReply, ReplyError>>>,
    default: GeneratedReply,
    requests: Mutex<Vec<ReplyRequest>>,
    delay: Option<Duration>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl ScriptedGenerator {
    pub fn confident(text: &str) -> Self {
        Self::with_default(text, 0.95)
    }

    pub fn with_default(text: &str, confidence: f64) -> Self {
        Self {
            script: Mutex::new(VecDeque::new()),
            default: GeneratedReply {
                text: text.to_string(),
                confidence,
                fallback: false,
            },
            requests: Mutex::new(Vec::new()),
            delay: None,
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    /// Holds every generation open for `delay`.
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Most generations that were ever running at the same time.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    pub fn push(&self, result: Result<GeneratedReply, ReplyError>) {
        self.script.lock().expect("script lock").push_back(result);
    }

    pub fn requests(&self) -> Vec<ReplyRequest> {
        self.requests.lock().expect("requests lock").clone()
    }
}

impl ReplyGenerator for ScriptedGenerator {
    fn generate(&self, request: &ReplyRequest) -> Result<GeneratedReply, ReplyError> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(running, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.script
            .lock()
            .expect("script lock")
            .pop_front()
            .unwrap_or_else(|| Ok(self.default.clone()))
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<AgentAlert>>,
}

impl RecordingNotifier {
    pub fn alerts(&self) -> Vec<AgentAlert> {
        self.alerts.lock().expect("alerts lock").clone()
    }
}

impl AgentNotifier for RecordingNotifier {
    fn notify(&self, alert: &AgentAlert) -> Result<(), CollaboratorError> {
        self.alerts.lock().expect("alerts lock").push(alert.clone());
        Ok(())
    }
}

pub struct Harness {
    _temp: TempDir,
    pub db: Database,
    pub state: GatewayState,
    pub control: RuntimeControl,
    pub generator: Arc<ScriptedGenerator>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Harness {
    pub fn start(config: RouterConfig) -> Self {
        Self::with_generator(config, ScriptedGenerator::confident("Happy to help!"))
    }

    pub fn with_generator(config: RouterConfig, generator: ScriptedGenerator) -> Self {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("inbox.db")).expect("open db");
        let generator = Arc::new(generator);
        let notifier = Arc::new(RecordingNotifier::default());
        let collaborators = Collaborators {
            notifier: notifier.clone(),
            ..Collaborators::default()
        };
        let (state, control) = start_runtime(
            Arc::new(config),
            db.clone(),
            generator.clone(),
            collaborators,
            false,
        );
        Self {
            _temp: temp,
            db,
            state,
            control,
            generator,
            notifier,
        }
    }

    pub fn post(
        &self,
        platform: &str,
        headers: &HeaderMap,
        body: &str,
    ) -> Result<WebhookAck, IngestError> {
        self.state.ingest().handle(platform, headers, body.as_bytes())
    }

    pub fn post_whatsapp(&self, body: &str) -> Result<WebhookAck, IngestError> {
        self.post("whatsapp", &whatsapp_headers(body), body)
    }

    pub fn post_livechat(&self, body: &str) -> Result<WebhookAck, IngestError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-livechat-signature",
            HeaderValue::from_str(&sign_sha256(LIVECHAT_SECRET, body)).expect("header"),
        );
        self.post("livechat", &headers, body)
    }

    pub fn directory(&self) -> ConversationDirectory {
        ConversationDirectory::new(self.db.clone())
    }

    pub fn messages(&self) -> MessageStore {
        MessageStore::new(self.db.clone())
    }

    pub fn engine(&self) -> &EscalationEngine {
        self.control.pipeline().engine()
    }

    pub fn conversations(&self, platform: Platform, external_id: &str) -> Vec<Conversation> {
        self.directory()
            .list_by_identity(platform, external_id)
            .expect("list conversations")
    }

    /// The single conversation for the identity; fails if there are more.
    pub fn only_conversation(&self, platform: Platform, external_id: &str) -> Conversation {
        let mut conversations = self.conversations(platform, external_id);
        assert_eq!(conversations.len(), 1, "expected exactly one conversation");
        conversations.remove(0)
    }

    pub fn thread(&self, conversation_id: &str) -> Vec<Message> {
        self.messages()
            .recent(conversation_id, 100)
            .expect("recent messages")
    }

    pub fn add_agent(&self, id: &str, department: &str) {
        let agent = Agent::new(id, department);
        self.engine().agents().upsert(&agent).expect("upsert agent");
    }
}

pub fn sign_sha256(secret: &str, body: &str) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac");
    mac.update(body.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

pub fn whatsapp_headers(body: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-hub-signature-256",
        HeaderValue::from_str(&sign_sha256(WHATSAPP_SECRET, body)).expect("header"),
    );
    headers
}

pub fn whatsapp_text(from: &str, message_id: &str, text: &str) -> String {
    serde_json::json!({
        "object": "whatsapp_business_account",
        "entry": [{
            "id": "WABA_ID",
            "changes": [{
                "field": "messages",
                "value": {
                    "messaging_product": "whatsapp",
                    "metadata": { "phone_number_id": WHATSAPP_PHONE_ID },
                    "contacts": [{ "wa_id": from, "profile": { "name": "Dana Customer" } }],
                    "messages": [{
                        "from": from,
                        "id": message_id,
                        "timestamp": "1714564800",
                        "type": "text",
                        "text": { "body": text }
                    }]
                }
            }]
        }]
    })
    .to_string()
}

pub fn livechat_message(session_id: &str, message_id: &str, author_type: &str, text: &str) -> String {
    serde_json::json!({
        "session_id": session_id,
        "message": {
            "id": message_id,
            "text": text,
            "author": { "id": format!("{}-1", author_type), "name": "Guest", "type": author_type }
        }
    })
    .to_string()
}
