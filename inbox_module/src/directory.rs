use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction, TransactionBehavior};
use tracing::{debug, info};
use uuid::Uuid;

use crate::channel::Platform;
use crate::conversation::{AiMode, Conversation, ConversationComment, ConversationStatus};
use crate::flow::FlowState;
use crate::store::{
    bool_to_int, format_datetime, parse_datetime, parse_label, parse_optional_datetime,
    retry_on_conflict, Database, StoreError,
};

pub(crate) const CONVERSATION_COLUMNS: &str = "id, platform, external_conversation_id, status, ai_mode, \
     assigned_agent, escalated_agent, requires_human_intervention, last_message_time, \
     last_message_preview, customer_id, customer_name, flow_state, escalation_reason, \
     escalated_at, escalated_by, created_at, updated_at, version";

/// Customer details carried by an inbound event.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdentityHints {
    pub customer_id: Option<String>,
    pub customer_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub conversation_id: String,
    pub created: bool,
}

/// Maps (platform, external conversation id) onto internal conversations.
#[derive(Debug, Clone)]
pub struct ConversationDirectory {
    db: Database,
}

impl ConversationDirectory {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn resolve(
        &self,
        platform: Platform,
        external_conversation_id: &str,
        hints: &IdentityHints,
        force_new: bool,
    ) -> Result<Resolution, StoreError> {
        retry_on_conflict("conversation", || {
            let mut conn = self.db.connection()?;
            if !force_new {
                if let Some(existing) = latest_for_identity(&conn, platform, external_conversation_id)? {
                    let reusable = !(existing.status.is_terminal() && platform.is_conversational());
                    if reusable {
                        enrich_customer(&conn, &existing, hints)?;
                        return Ok(Some(Resolution {
                            conversation_id: existing.id,
                            created: false,
                        }));
                    }
                }
            }

            let tx = conn.transaction()?;
            if force_new {
                tx.execute(
                    "UPDATE conversations SET open_slot = NULL, version = version + 1
                     WHERE platform = ?1 AND open_slot = ?2",
                    params![platform.as_str(), external_conversation_id],
                )?;
            }
            let id = Uuid::new_v4().to_string();
            if insert_conversation(&tx, &id, platform, external_conversation_id, hints)? {
                tx.commit()?;
                info!(
                    "conversation created id={} platform={} external_id={}",
                    id, platform, external_conversation_id
                );
                return Ok(Some(Resolution {
                    conversation_id: id,
                    created: true,
                }));
            }
            drop(tx);

            // Lost the race for the open slot: the winner's row is the conversation.
            let winner: Option<String> = conn
                .query_row(
                    "SELECT id FROM conversations WHERE platform = ?1 AND open_slot = ?2",
                    params![platform.as_str(), external_conversation_id],
                    |row| row.get(0),
                )
                .optional()?;
            debug!(
                "conversation create collapsed platform={} external_id={} winner={:?}",
                platform, external_conversation_id, winner
            );
            Ok(winner.map(|conversation_id| Resolution {
                conversation_id,
                created: false,
            }))
        })
    }

    pub fn get(&self, id: &str) -> Result<Option<Conversation>, StoreError> {
        let conn = self.db.connection()?;
        load_conversation(&conn, id)
    }

    pub fn require(&self, id: &str) -> Result<Conversation, StoreError> {
        self.get(id)?
            .ok_or_else(|| StoreError::not_found("conversation", id))
    }

    /// Applies `change` to a fresh copy of the conversation and writes it back
    /// under the optimistic version check, retrying on conflict.
    pub fn update(
        &self,
        id: &str,
        mut change: impl FnMut(&mut Conversation),
    ) -> Result<Conversation, StoreError> {
        retry_on_conflict("conversation", || {
            let conn = self.db.connection()?;
            let mut conversation = load_conversation(&conn, id)?
                .ok_or_else(|| StoreError::not_found("conversation", id))?;
            change(&mut conversation);
            if write_conversation(&conn, &conversation)? {
                conversation.version += 1;
                Ok(Some(conversation))
            } else {
                Ok(None)
            }
        })
    }

    pub fn set_status(&self, id: &str, status: ConversationStatus) -> Result<Conversation, StoreError> {
        if status.is_terminal() {
            return self.terminate(id, status);
        }
        self.update(id, |conversation| conversation.status = status)
    }

    pub fn set_ai_mode(&self, id: &str, mode: AiMode) -> Result<Conversation, StoreError> {
        self.update(id, |conversation| conversation.ai_mode = mode)
    }

    pub fn set_flow_state(
        &self,
        id: &str,
        flow_state: Option<FlowState>,
    ) -> Result<Conversation, StoreError> {
        self.update(id, |conversation| conversation.flow_state = flow_state.clone())
    }

    /// Starts a survey on the conversation and returns the first question.
    pub fn start_survey(
        &self,
        id: &str,
        survey_id: &str,
        questions: Vec<String>,
    ) -> Result<Option<String>, StoreError> {
        let Some((state, prompt)) = FlowState::start_survey(survey_id, questions, Utc::now()) else {
            return Ok(None);
        };
        self.set_flow_state(id, Some(state))?;
        Ok(Some(prompt))
    }

    /// Resolves or closes the conversation: frees its open slot, releases the
    /// assigned agent's workload and closes queued escalation records.
    /// Terminating an already terminal conversation changes nothing.
    pub fn terminate(
        &self,
        id: &str,
        status: ConversationStatus,
    ) -> Result<Conversation, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "{} is not a terminal status",
                status
            )));
        }
        retry_on_conflict("conversation", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut conversation = load_conversation(&tx, id)?
                .ok_or_else(|| StoreError::not_found("conversation", id))?;
            if conversation.status.is_terminal() {
                return Ok(Some(conversation));
            }
            conversation.status = status;
            conversation.flow_state = None;
            if !write_conversation(&tx, &conversation)? {
                return Ok(None);
            }
            conversation.version += 1;
            release_on_terminate(&tx, &conversation)?;
            tx.commit()?;
            info!(
                "conversation terminated id={} status={} agent={:?}",
                conversation.id, status, conversation.assigned_agent
            );
            Ok(Some(conversation))
        })
    }

    /// Non-terminal conversations with no agent, not yet escalated, and no
    /// activity since `cutoff`.
    pub fn list_inactive(&self, cutoff: DateTime<Utc>) -> Result<Vec<Conversation>, StoreError> {
        self.list_where(
            "status NOT IN ('resolved', 'closed', 'escalated')
             AND assigned_agent IS NULL
             AND escalated_at IS NULL
             AND COALESCE(last_message_time, created_at) <= ?1",
            params![format_datetime(cutoff)],
        )
    }

    pub fn list_assigned_open(&self) -> Result<Vec<Conversation>, StoreError> {
        self.list_where(
            "status NOT IN ('resolved', 'closed') AND assigned_agent IS NOT NULL",
            params![],
        )
    }

    pub fn list_by_identity(
        &self,
        platform: Platform,
        external_conversation_id: &str,
    ) -> Result<Vec<Conversation>, StoreError> {
        self.list_where(
            "platform = ?1 AND external_conversation_id = ?2",
            params![platform.as_str(), external_conversation_id],
        )
    }

    pub fn add_comment(
        &self,
        conversation_id: &str,
        author: &str,
        body: &str,
    ) -> Result<ConversationComment, StoreError> {
        let conn = self.db.connection()?;
        insert_comment(&conn, conversation_id, author, body)
    }

    pub fn comments(&self, conversation_id: &str) -> Result<Vec<ConversationComment>, StoreError> {
        let conn = self.db.connection()?;
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, author, body, created_at
             FROM conversation_comments
             WHERE conversation_id = ?1
             ORDER BY created_at, rowid",
        )?;
        let rows = stmt.query_map(params![conversation_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;
        let mut comments = Vec::new();
        for row in rows {
            let (id, conversation_id, author, body, created_at_raw) = row?;
            comments.push(ConversationComment {
                id,
                conversation_id,
                author,
                body,
                created_at: parse_datetime(&created_at_raw)?,
            });
        }
        Ok(comments)
    }

    fn list_where<P: rusqlite::Params>(
        &self,
        filter: &str,
        params: P,
    ) -> Result<Vec<Conversation>, StoreError> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM conversations WHERE {} ORDER BY created_at, rowid",
            CONVERSATION_COLUMNS, filter
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, ConversationRow::from_row)?;
        let mut conversations = Vec::new();
        for row in rows {
            conversations.push(row?.into_conversation()?);
        }
        Ok(conversations)
    }
}

pub(crate) fn insert_comment(
    conn: &Connection,
    conversation_id: &str,
    author: &str,
    body: &str,
) -> Result<ConversationComment, StoreError> {
    let comment = ConversationComment {
        id: Uuid::new_v4().to_string(),
        conversation_id: conversation_id.to_string(),
        author: author.to_string(),
        body: body.to_string(),
        created_at: Utc::now(),
    };
    conn.execute(
        "INSERT INTO conversation_comments (id, conversation_id, author, body, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            comment.id,
            comment.conversation_id,
            comment.author,
            comment.body,
            format_datetime(comment.created_at)
        ],
    )?;
    Ok(comment)
}

fn release_on_terminate(tx: &Transaction<'_>, conversation: &Conversation) -> Result<(), StoreError> {
    if let Some(agent_id) = conversation.assigned_agent.as_deref() {
        tx.execute(
            "UPDATE agents SET current_workload = current_workload - 1
             WHERE id = ?1 AND current_workload > 0",
            params![agent_id],
        )?;
    }
    tx.execute(
        "UPDATE escalations SET open = 0, closed_at = ?2
         WHERE conversation_id = ?1 AND open = 1",
        params![conversation.id, format_datetime(Utc::now())],
    )?;
    Ok(())
}

fn insert_conversation(
    conn: &Connection,
    id: &str,
    platform: Platform,
    external_conversation_id: &str,
    hints: &IdentityHints,
) -> Result<bool, StoreError> {
    let now = format_datetime(Utc::now());
    let inserted = conn.execute(
        "INSERT INTO conversations (
            id, platform, external_conversation_id, open_slot, status, ai_mode,
            customer_id, customer_name, created_at, updated_at, version
         ) VALUES (?1, ?2, ?3, ?3, ?4, ?5, ?6, ?7, ?8, ?8, 0)
         ON CONFLICT DO NOTHING",
        params![
            id,
            platform.as_str(),
            external_conversation_id,
            ConversationStatus::New.as_str(),
            AiMode::Auto.as_str(),
            hints.customer_id,
            hints.customer_name,
            now
        ],
    )?;
    Ok(inserted == 1)
}

fn latest_for_identity(
    conn: &Connection,
    platform: Platform,
    external_conversation_id: &str,
) -> Result<Option<Conversation>, StoreError> {
    let sql = format!(
        "SELECT {} FROM conversations
         WHERE platform = ?1 AND external_conversation_id = ?2
         ORDER BY created_at DESC, rowid DESC
         LIMIT 1",
        CONVERSATION_COLUMNS
    );
    conn.query_row(
        &sql,
        params![platform.as_str(), external_conversation_id],
        ConversationRow::from_row,
    )
    .optional()?
    .map(ConversationRow::into_conversation)
    .transpose()
}

pub(crate) fn load_conversation(
    conn: &Connection,
    id: &str,
) -> Result<Option<Conversation>, StoreError> {
    let sql = format!("SELECT {} FROM conversations WHERE id = ?1", CONVERSATION_COLUMNS);
    conn.query_row(&sql, params![id], ConversationRow::from_row)
        .optional()?
        .map(ConversationRow::into_conversation)
        .transpose()
}

/// Writes the mutable columns when the stored version still matches.
/// Terminal conversations give up their open slot.
pub(crate) fn write_conversation(
    conn: &Connection,
    conversation: &Conversation,
) -> Result<bool, StoreError> {
    let flow_state = conversation
        .flow_state
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    let changed = conn.execute(
        "UPDATE conversations SET
            status = ?1,
            ai_mode = ?2,
            assigned_agent = ?3,
            escalated_agent = ?4,
            requires_human_intervention = ?5,
            customer_id = ?6,
            customer_name = ?7,
            flow_state = ?8,
            escalation_reason = ?9,
            escalated_at = ?10,
            escalated_by = ?11,
            open_slot = CASE WHEN ?12 THEN NULL ELSE open_slot END,
            updated_at = ?13,
            version = version + 1
         WHERE id = ?14 AND version = ?15",
        params![
            conversation.status.as_str(),
            conversation.ai_mode.as_str(),
            conversation.assigned_agent,
            conversation.escalated_agent,
            bool_to_int(conversation.requires_human_intervention),
            conversation.customer_id,
            conversation.customer_name,
            flow_state,
            conversation.escalation_reason,
            conversation.escalated_at.map(format_datetime),
            conversation.escalated_by,
            conversation.status.is_terminal(),
            format_datetime(Utc::now()),
            conversation.id,
            conversation.version
        ],
    )?;
    Ok(changed == 1)
}

fn enrich_customer(
    conn: &Connection,
    existing: &Conversation,
    hints: &IdentityHints,
) -> Result<(), StoreError> {
    let sender_id = hints
        .customer_id
        .as_deref()
        .or(existing.customer_id.as_deref());
    let better_name = hints.customer_name.as_deref().filter(|candidate| {
        is_placeholder_name(existing.customer_name.as_deref(), sender_id)
            && !is_placeholder_name(Some(*candidate), sender_id)
    });
    let missing_customer_id = existing.customer_id.is_none() && hints.customer_id.is_some();
    if better_name.is_none() && !missing_customer_id {
        return Ok(());
    }
    conn.execute(
        "UPDATE conversations SET
            customer_name = COALESCE(?1, customer_name),
            customer_id = COALESCE(customer_id, ?2),
            version = version + 1
         WHERE id = ?3",
        params![better_name, hints.customer_id, existing.id],
    )?;
    debug!(
        "conversation customer enriched id={} name={:?}",
        existing.id, better_name
    );
    Ok(())
}

/// Names that carry no information about the customer.
pub fn is_placeholder_name(name: Option<&str>, sender_id: Option<&str>) -> bool {
    let Some(name) = name.map(str::trim) else {
        return true;
    };
    if name.is_empty() {
        return true;
    }
    if ["unknown", "guest", "customer"]
        .iter()
        .any(|placeholder| name.eq_ignore_ascii_case(placeholder))
    {
        return true;
    }
    if sender_id.is_some_and(|sender| sender.trim() == name) {
        return true;
    }
    looks_like_phone_number(name)
}

fn looks_like_phone_number(value: &str) -> bool {
    let digits = value.chars().filter(char::is_ascii_digit).count();
    digits >= 6
        && value
            .chars()
            .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')' | '.'))
}

struct ConversationRow {
    id: String,
    platform: String,
    external_conversation_id: String,
    status: String,
    ai_mode: String,
    assigned_agent: Option<String>,
    escalated_agent: Option<String>,
    requires_human_intervention: i64,
    last_message_time: Option<String>,
    last_message_preview: Option<String>,
    customer_id: Option<String>,
    customer_name: Option<String>,
    flow_state: Option<String>,
    escalation_reason: Option<String>,
    escalated_at: Option<String>,
    escalated_by: Option<String>,
    created_at: String,
    updated_at: String,
    version: i64,
}

impl ConversationRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            platform: row.get(1)?,
            external_conversation_id: row.get(2)?,
            status: row.get(3)?,
            ai_mode: row.get(4)?,
            assigned_agent: row.get(5)?,
            escalated_agent: row.get(6)?,
            requires_human_intervention: row.get(7)?,
            last_message_time: row.get(8)?,
            last_message_preview: row.get(9)?,
            customer_id: row.get(10)?,
            customer_name: row.get(11)?,
            flow_state: row.get(12)?,
            escalation_reason: row.get(13)?,
            escalated_at: row.get(14)?,
            escalated_by: row.get(15)?,
            created_at: row.get(16)?,
            updated_at: row.get(17)?,
            version: row.get(18)?,
        })
    }

    fn into_conversation(self) -> Result<Conversation, StoreError> {
        let flow_state = match self.flow_state.as_deref() {
            Some(raw) if !raw.trim().is_empty() => Some(serde_json::from_str(raw)?),
            _ => None,
        };
        Ok(Conversation {
            platform: parse_label(&self.platform)?,
            status: parse_label(&self.status)?,
            ai_mode: parse_label(&self.ai_mode)?,
            requires_human_intervention: self.requires_human_intervention != 0,
            last_message_time: parse_optional_datetime(self.last_message_time.as_deref())?,
            escalated_at: parse_optional_datetime(self.escalated_at.as_deref())?,
            created_at: parse_datetime(&self.created_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            flow_state,
            id: self.id,
            external_conversation_id: self.external_conversation_id,
            assigned_agent: self.assigned_agent,
            escalated_agent: self.escalated_agent,
            last_message_preview: self.last_message_preview,
            customer_id: self.customer_id,
            customer_name: self.customer_name,
            escalation_reason: self.escalation_reason,
            escalated_by: self.escalated_by,
            version: self.version,
        })
    }
}
