use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tracing::debug;
use uuid::Uuid;

use crate::channel::SendOutcome;
use crate::conversation::{DeliveryStatus, Message, MessageDirection, NewMessage};
use crate::store::{
    bool_to_int, format_datetime, parse_datetime, parse_label, retry_on_conflict, Database,
    StoreError,
};

/// External ids longer than this are stored as a `sha256:` surrogate.
pub const MAX_EXTERNAL_ID_LEN: usize = 140;
pub const PREVIEW_CHARS: usize = 100;

const MESSAGE_COLUMNS: &str = "id, conversation_id, direction, external_id, sender_id, content, \
     timestamp, metadata, processed_by_ai, ai_confidence, requires_escalation, handled_by_agent, \
     delivery_status, delivery_detail, created_at";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    pub message_id: String,
    /// False when the external id was already stored; `message_id` is the existing row.
    pub inserted: bool,
}

/// Returns the storage key for an external id and, when it had to be hashed,
/// the original value.
pub fn normalize_external_id(raw: &str) -> (String, Option<String>) {
    if raw.chars().count() <= MAX_EXTERNAL_ID_LEN {
        return (raw.to_string(), None);
    }
    let digest = Sha256::digest(raw.as_bytes());
    (format!("sha256:{}", hex::encode(digest)), Some(raw.to_string()))
}

fn derived_external_id(conversation_id: &str, message: &NewMessage) -> String {
    let timestamp = format_datetime(message.timestamp);
    let mut hasher = Sha256::new();
    for part in [
        conversation_id,
        message.direction.as_str(),
        message.sender_id.as_str(),
        timestamp.as_str(),
        message.content.as_str(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("derived:{}", hex::encode(hasher.finalize()))
}

pub fn preview(content: &str) -> String {
    let collapsed = content.split_whitespace().collect::<Vec<_>>().join(" ");
    collapsed.chars().take(PREVIEW_CHARS).collect()
}

#[derive(Debug, Clone)]
pub struct MessageStore {
    db: Database,
}

impl MessageStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stores the message unless its external id already exists anywhere.
    /// A new inbound row also moves the conversation's last-message marker forward.
    pub fn append(
        &self,
        conversation_id: &str,
        message: NewMessage,
    ) -> Result<AppendOutcome, StoreError> {
        let (external_id, original) = match message.external_id.as_deref() {
            Some(raw) if !raw.trim().is_empty() => normalize_external_id(raw),
            _ => (derived_external_id(conversation_id, &message), None),
        };
        let metadata = with_original_id(message.metadata.clone(), original);
        let metadata_raw = match &metadata {
            Value::Null => None,
            other => Some(serde_json::to_string(other)?),
        };
        let timestamp = format_datetime(message.timestamp);

        retry_on_conflict("message", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let id = Uuid::new_v4().to_string();
            let inserted = tx.execute(
                "INSERT INTO messages (
                    id, conversation_id, direction, external_id, sender_id, content,
                    timestamp, metadata, created_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(external_id) DO NOTHING",
                params![
                    id,
                    conversation_id,
                    message.direction.as_str(),
                    external_id,
                    message.sender_id,
                    message.content,
                    timestamp,
                    metadata_raw,
                    format_datetime(Utc::now())
                ],
            )? == 1;

            if inserted {
                tx.execute(
                    "UPDATE conversations SET
                        last_message_time = ?1,
                        last_message_preview = ?2,
                        updated_at = ?3,
                        version = version + 1
                     WHERE id = ?4
                       AND (last_message_time IS NULL OR last_message_time <= ?1)",
                    params![
                        timestamp,
                        preview(&message.content),
                        format_datetime(Utc::now()),
                        conversation_id
                    ],
                )?;
                tx.commit()?;
                return Ok(Some(AppendOutcome {
                    message_id: id,
                    inserted: true,
                }));
            }

            let existing: Option<String> = tx
                .query_row(
                    "SELECT id FROM messages WHERE external_id = ?1",
                    params![external_id],
                    |row| row.get(0),
                )
                .optional()?;
            debug!(
                "duplicate message external_id={} existing={:?}",
                external_id, existing
            );
            Ok(existing.map(|message_id| AppendOutcome {
                message_id,
                inserted: false,
            }))
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Message>, StoreError> {
        let conn = self.db.connection()?;
        query_one(&conn, "id = ?1", id)
    }

    pub fn require(&self, id: &str) -> Result<Message, StoreError> {
        self.get(id)?.ok_or_else(|| StoreError::not_found("message", id))
    }

    /// Looks a message up by its platform id (normalized the same way as on append).
    pub fn find_by_external_id(&self, raw_external_id: &str) -> Result<Option<Message>, StoreError> {
        let (key, _) = normalize_external_id(raw_external_id);
        let conn = self.db.connection()?;
        query_one(&conn, "external_id = ?1", &key)
    }

    /// Last `limit` messages of the conversation, oldest first.
    pub fn recent(&self, conversation_id: &str, limit: usize) -> Result<Vec<Message>, StoreError> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM messages
             WHERE conversation_id = ?1
             ORDER BY timestamp DESC, rowid DESC
             LIMIT ?2",
            MESSAGE_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![conversation_id, limit as i64], MessageRow::from_row)?;
        let mut messages = Vec::new();
        for row in rows {
            messages.push(row?.into_message()?);
        }
        messages.reverse();
        Ok(messages)
    }

    pub fn count_for_conversation(&self, conversation_id: &str) -> Result<i64, StoreError> {
        let conn = self.db.connection()?;
        let count = conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE conversation_id = ?1",
            params![conversation_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn mark_ai_processed(
        &self,
        message_id: &str,
        confidence: Option<f64>,
        requires_escalation: bool,
    ) -> Result<(), StoreError> {
        self.update_flags(
            "UPDATE messages SET processed_by_ai = 1, ai_confidence = ?2, requires_escalation = ?3
             WHERE id = ?1",
            message_id,
            params![message_id, confidence, bool_to_int(requires_escalation)],
        )
    }

    pub fn mark_handled_by_agent(&self, message_id: &str) -> Result<(), StoreError> {
        self.update_flags(
            "UPDATE messages SET handled_by_agent = 1 WHERE id = ?1",
            message_id,
            params![message_id],
        )
    }

    pub fn record_delivery(&self, message_id: &str, outcome: &SendOutcome) -> Result<(), StoreError> {
        let status = if outcome.ok {
            DeliveryStatus::Sent
        } else {
            DeliveryStatus::Failed
        };
        let detail = serde_json::to_string(&json!({
            "status_code": outcome.status_code,
            "response_body": outcome.response_body,
            "error_detail": outcome.error_detail,
            "external_id": outcome.external_id,
        }))?;
        self.update_flags(
            "UPDATE messages SET delivery_status = ?2, delivery_detail = ?3 WHERE id = ?1",
            message_id,
            params![message_id, status.as_str(), detail],
        )
    }

    fn update_flags<P: rusqlite::Params>(
        &self,
        sql: &str,
        message_id: &str,
        params: P,
    ) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        if conn.execute(sql, params)? == 0 {
            return Err(StoreError::not_found("message", message_id));
        }
        Ok(())
    }
}

fn with_original_id(metadata: Value, original: Option<String>) -> Value {
    let Some(original) = original else {
        return metadata;
    };
    match metadata {
        Value::Object(mut map) => {
            map.insert("original_external_id".to_string(), Value::String(original));
            Value::Object(map)
        }
        Value::Null => json!({ "original_external_id": original }),
        other => json!({ "original_external_id": original, "payload": other }),
    }
}

fn query_one(conn: &Connection, filter: &str, value: &str) -> Result<Option<Message>, StoreError> {
    let sql = format!("SELECT {} FROM messages WHERE {}", MESSAGE_COLUMNS, filter);
    conn.query_row(&sql, params![value], MessageRow::from_row)
        .optional()?
        .map(MessageRow::into_message)
        .transpose()
}

struct MessageRow {
    id: String,
    conversation_id: String,
    direction: String,
    external_id: String,
    sender_id: String,
    content: String,
    timestamp: String,
    metadata: Option<String>,
    processed_by_ai: i64,
    ai_confidence: Option<f64>,
    requires_escalation: i64,
    handled_by_agent: i64,
    delivery_status: Option<String>,
    delivery_detail: Option<String>,
    created_at: String,
}

impl MessageRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            direction: row.get(2)?,
            external_id: row.get(3)?,
            sender_id: row.get(4)?,
            content: row.get(5)?,
            timestamp: row.get(6)?,
            metadata: row.get(7)?,
            processed_by_ai: row.get(8)?,
            ai_confidence: row.get(9)?,
            requires_escalation: row.get(10)?,
            handled_by_agent: row.get(11)?,
            delivery_status: row.get(12)?,
            delivery_detail: row.get(13)?,
            created_at: row.get(14)?,
        })
    }

    fn into_message(self) -> Result<Message, StoreError> {
        let metadata = match self.metadata.as_deref() {
            Some(raw) => serde_json::from_str(raw)?,
            None => Value::Null,
        };
        let delivery_detail = self
            .delivery_detail
            .as_deref()
            .map(serde_json::from_str)
            .transpose()?;
        Ok(Message {
            direction: parse_label::<MessageDirection>(&self.direction)?,
            timestamp: parse_datetime(&self.timestamp)?,
            created_at: parse_datetime(&self.created_at)?,
            delivery_status: self
                .delivery_status
                .as_deref()
                .map(parse_label::<DeliveryStatus>)
                .transpose()?,
            processed_by_ai: self.processed_by_ai != 0,
            requires_escalation: self.requires_escalation != 0,
            handled_by_agent: self.handled_by_agent != 0,
            metadata,
            delivery_detail,
            id: self.id,
            conversation_id: self.conversation_id,
            external_id: self.external_id,
            sender_id: self.sender_id,
            content: self.content,
            ai_confidence: self.ai_confidence,
        })
    }
}
