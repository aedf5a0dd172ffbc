pub(super) const INBOX_SCHEMA: &str = r#"
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS conversations (
    id TEXT PRIMARY KEY,
    platform TEXT NOT NULL,
    external_conversation_id TEXT NOT NULL,
    open_slot TEXT,
    status TEXT NOT NULL,
    ai_mode TEXT NOT NULL DEFAULT 'auto',
    assigned_agent TEXT,
    escalated_agent TEXT,
    requires_human_intervention INTEGER NOT NULL DEFAULT 0,
    last_message_time TEXT,
    last_message_preview TEXT,
    customer_id TEXT,
    customer_name TEXT,
    flow_state TEXT,
    escalation_reason TEXT,
    escalated_at TEXT,
    escalated_by TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    version INTEGER NOT NULL DEFAULT 0
);

CREATE UNIQUE INDEX IF NOT EXISTS idx_conversations_open_slot
    ON conversations (platform, open_slot);
CREATE INDEX IF NOT EXISTS idx_conversations_identity
    ON conversations (platform, external_conversation_id, created_at);
CREATE INDEX IF NOT EXISTS idx_conversations_status
    ON conversations (status);

CREATE TABLE IF NOT EXISTS messages (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    direction TEXT NOT NULL,
    external_id TEXT NOT NULL UNIQUE,
    sender_id TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    metadata TEXT,
    processed_by_ai INTEGER NOT NULL DEFAULT 0,
    ai_confidence REAL,
    requires_escalation INTEGER NOT NULL DEFAULT 0,
    handled_by_agent INTEGER NOT NULL DEFAULT 0,
    delivery_status TEXT,
    delivery_detail TEXT,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_messages_conversation
    ON messages (conversation_id, timestamp);

CREATE TABLE IF NOT EXISTS agents (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    department TEXT NOT NULL,
    current_workload INTEGER NOT NULL DEFAULT 0,
    max_concurrent INTEGER NOT NULL DEFAULT 5,
    status TEXT NOT NULL DEFAULT 'available',
    specializations TEXT NOT NULL DEFAULT '[]',
    last_assignment TEXT,
    working_hours_start INTEGER,
    working_hours_end INTEGER,
    enabled INTEGER NOT NULL DEFAULT 1,
    CHECK (current_workload >= 0)
);

CREATE INDEX IF NOT EXISTS idx_agents_department
    ON agents (department, status);

CREATE TABLE IF NOT EXISTS escalations (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    escalation_type TEXT NOT NULL,
    requester_role TEXT NOT NULL,
    priority TEXT NOT NULL,
    department TEXT NOT NULL,
    outcome TEXT NOT NULL,
    assigned_agent TEXT,
    queue_position INTEGER,
    estimated_wait_minutes INTEGER,
    target_response_minutes INTEGER NOT NULL,
    contact_method TEXT NOT NULL,
    reason TEXT NOT NULL,
    actor TEXT NOT NULL,
    open INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    closed_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_escalations_queue
    ON escalations (department, outcome, open, created_at);
CREATE INDEX IF NOT EXISTS idx_escalations_conversation
    ON escalations (conversation_id, created_at);

CREATE TABLE IF NOT EXISTS conversation_comments (
    id TEXT PRIMARY KEY,
    conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
    author TEXT NOT NULL,
    body TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS conversation_leases (
    conversation_id TEXT PRIMARY KEY,
    holder TEXT NOT NULL,
    expires_at TEXT NOT NULL
);
"#;
