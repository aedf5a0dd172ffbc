use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row, TransactionBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use super::agents::{self, AgentStore};
use super::rules::configure;
use super::scoring::rank_candidates;
use super::types::{
    EscalationOutcome, EscalationPlan, EscalationRecord, EscalationRequest, EscalationResult,
    EscalationType, Priority, RecordOutcome, RequesterRole,
};
use crate::collaborators::{AgentAlert, AlertKind, CaseUpdate, Collaborators};
use crate::config::EscalationConfig;
use crate::conversation::{Conversation, ConversationStatus};
use crate::directory::{insert_comment, load_conversation, write_conversation, ConversationDirectory};
use crate::store::{
    bool_to_int, format_datetime, parse_datetime, parse_label, parse_optional_datetime,
    retry_on_conflict, Database, StoreError,
};

const RECORD_COLUMNS: &str = "id, conversation_id, escalation_type, requester_role, priority, \
     department, outcome, assigned_agent, queue_position, estimated_wait_minutes, \
     target_response_minutes, contact_method, reason, actor, open, created_at, closed_at";

/// Picks an agent for escalated conversations, or queues them.
#[derive(Debug, Clone)]
pub struct EscalationEngine {
    db: Database,
    directory: ConversationDirectory,
    agents: AgentStore,
    settings: EscalationConfig,
    collaborators: Collaborators,
}

impl EscalationEngine {
    pub fn new(db: Database, settings: EscalationConfig, collaborators: Collaborators) -> Self {
        Self {
            directory: ConversationDirectory::new(db.clone()),
            agents: AgentStore::new(db.clone()),
            db,
            settings,
            collaborators,
        }
    }

    pub fn agents(&self) -> &AgentStore {
        &self.agents
    }

    pub fn settings(&self) -> &EscalationConfig {
        &self.settings
    }

    pub fn escalate(&self, request: &EscalationRequest) -> Result<EscalationResult, StoreError> {
        self.escalate_at(request, Utc::now())
    }

    /// Assigns the best available agent, or queues the conversation when
    /// nobody in the department can take it.
    pub fn escalate_at(
        &self,
        request: &EscalationRequest,
        now: DateTime<Utc>,
    ) -> Result<EscalationResult, StoreError> {
        let mut plan = configure(
            request.escalation_type,
            request.requester_role,
            request.priority,
        );
        if let Some(department) = request.department.as_deref() {
            plan.department = department.to_string();
        }

        let conversation = self.directory.require(&request.conversation_id)?;
        if conversation.status.is_terminal() {
            return Err(StoreError::Invalid(format!(
                "conversation {} is {}",
                conversation.id, conversation.status
            )));
        }

        if let Some(current) = conversation.assigned_agent.as_deref() {
            if request.exclude_agent.as_deref() != Some(current) {
                let result = self.commit_assignment(request, &plan, current, now)?;
                self.announce(&result, AlertKind::Assigned);
                return Ok(result);
            }
        }

        let candidates = rank_candidates(
            self.agents.list_department(&plan.department)?,
            &plan,
            now,
            request.exclude_agent.as_deref(),
        );
        for (agent, score) in candidates {
            if !self.agents.try_claim(&agent.id)? {
                continue;
            }
            match self.commit_assignment(request, &plan, &agent.id, now) {
                Ok(result) => {
                    info!(
                        "escalation assigned conversation_id={} agent_id={} score={} department={}",
                        request.conversation_id, agent.id, score, plan.department
                    );
                    self.announce(&result, AlertKind::Assigned);
                    return Ok(result);
                }
                Err(err) => {
                    if let Err(release_err) = self.agents.release(&agent.id) {
                        warn!(
                            "failed to release claim agent_id={}: {}",
                            agent.id, release_err
                        );
                    }
                    return Err(err);
                }
            }
        }

        let result = self.enqueue(request, &plan, now)?;
        self.announce(&result, AlertKind::Queued);
        Ok(result)
    }

    /// Releases the current agent and hands the conversation to someone else
    /// in the same department, or queues it.
    pub fn reassign(
        &self,
        conversation_id: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<EscalationResult>, StoreError> {
        let conversation = self.directory.require(conversation_id)?;
        let Some(previous) = conversation.assigned_agent.clone() else {
            return Ok(None);
        };
        if conversation.status.is_terminal() {
            return Ok(None);
        }

        let last = self.records_for(conversation_id)?.into_iter().last();
        let department = match &last {
            Some(record) => record.department.clone(),
            None => match self.agents.get(&previous)? {
                Some(agent) => agent.department,
                None => configure(EscalationType::General, RequesterRole::Customer, Priority::Normal)
                    .department,
            },
        };

        retry_on_conflict("conversation", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut current = load_conversation(&tx, conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation", conversation_id))?;
            if current.assigned_agent.as_deref() != Some(previous.as_str()) {
                return Ok(Some(()));
            }
            current.assigned_agent = None;
            if !write_conversation(&tx, &current)? {
                return Ok(None);
            }
            agents::release(&tx, &previous)?;
            insert_comment(
                &tx,
                conversation_id,
                "system",
                &format!("Reassigned from agent {}: {}", previous, reason),
            )?;
            tx.commit()?;
            Ok(Some(()))
        })?;
        info!(
            "conversation released for reassignment conversation_id={} previous_agent={} reason={}",
            conversation_id, previous, reason
        );

        let mut request = EscalationRequest::new(
            conversation_id,
            last.as_ref()
                .map(|record| record.escalation_type)
                .unwrap_or(EscalationType::General),
            reason,
        )
        .with_department(department)
        .excluding(previous);
        if let Some(record) = &last {
            request.requester_role = record.requester_role;
        }
        let result = self.escalate_at(&request, now)?;
        if let EscalationOutcome::Assigned { agent_id } = &result.outcome {
            self.notify(&alert_for(&result, AlertKind::Reassigned, Some(agent_id.clone())));
        }
        Ok(Some(result))
    }

    /// Tries to assign queued conversations, oldest first. Returns how many
    /// left the queue.
    pub fn drain_queue(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let queued = self.query_records(
            "outcome = 'queued' AND open = 1 ORDER BY created_at, rowid",
            params![],
        )?;
        let mut assigned = 0;
        for record in queued {
            let mut plan = configure(record.escalation_type, record.requester_role, Priority::Low);
            plan.department = record.department.clone();
            plan.priority = record.priority;
            let candidates =
                rank_candidates(self.agents.list_department(&plan.department)?, &plan, now, None);
            let request = EscalationRequest {
                conversation_id: record.conversation_id.clone(),
                escalation_type: record.escalation_type,
                requester_role: record.requester_role,
                priority: record.priority,
                reason: record.reason.clone(),
                actor: "system".to_string(),
                department: Some(record.department.clone()),
                exclude_agent: None,
            };
            for (agent, _) in candidates {
                if !self.agents.try_claim(&agent.id)? {
                    continue;
                }
                match self.commit_assignment(&request, &plan, &agent.id, now) {
                    Ok(result) => {
                        info!(
                            "queued conversation assigned conversation_id={} agent_id={}",
                            record.conversation_id, agent.id
                        );
                        self.announce(&result, AlertKind::Assigned);
                        assigned += 1;
                    }
                    Err(err) => {
                        agents::release(&self.db.connection()?, &agent.id)?;
                        warn!(
                            "queue drain failed conversation_id={}: {}",
                            record.conversation_id, err
                        );
                    }
                }
                break;
            }
        }
        Ok(assigned)
    }

    pub fn records_for(&self, conversation_id: &str) -> Result<Vec<EscalationRecord>, StoreError> {
        self.query_records(
            "conversation_id = ?1 ORDER BY created_at, rowid",
            params![conversation_id],
        )
    }

    pub fn open_queue(&self, department: &str) -> Result<Vec<EscalationRecord>, StoreError> {
        self.query_records(
            "department = ?1 AND outcome = 'queued' AND open = 1 ORDER BY created_at, rowid",
            params![department],
        )
    }

    fn commit_assignment(
        &self,
        request: &EscalationRequest,
        plan: &EscalationPlan,
        agent_id: &str,
        now: DateTime<Utc>,
    ) -> Result<EscalationResult, StoreError> {
        retry_on_conflict("conversation", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut conversation = load_conversation(&tx, &request.conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation", &request.conversation_id))?;
            let previous = conversation.assigned_agent.clone();

            mark_escalated(&mut conversation, request, now);
            conversation.assigned_agent = Some(agent_id.to_string());
            conversation.escalated_agent = Some(agent_id.to_string());
            conversation.status = ConversationStatus::AgentAssigned;
            if !write_conversation(&tx, &conversation)? {
                return Ok(None);
            }
            if let Some(previous) = previous.as_deref().filter(|p| *p != agent_id) {
                agents::release(&tx, previous)?;
            }
            agents::stamp_assignment(&tx, agent_id, now)?;
            close_open_records(&tx, &request.conversation_id, now)?;
            let record = new_record(request, plan, RecordOutcome::Assigned, now);
            let record = EscalationRecord {
                assigned_agent: Some(agent_id.to_string()),
                ..record
            };
            insert_record(&tx, &record)?;
            tx.commit()?;
            Ok(Some(EscalationResult {
                plan: plan.clone(),
                outcome: EscalationOutcome::Assigned {
                    agent_id: agent_id.to_string(),
                },
                record,
            }))
        })
    }

    fn enqueue(
        &self,
        request: &EscalationRequest,
        plan: &EscalationPlan,
        now: DateTime<Utc>,
    ) -> Result<EscalationResult, StoreError> {
        let base_wait = self.settings.base_wait_for(&plan.department);
        let result = retry_on_conflict("conversation", || {
            let mut conn = self.db.connection()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut conversation = load_conversation(&tx, &request.conversation_id)?
                .ok_or_else(|| StoreError::not_found("conversation", &request.conversation_id))?;
            mark_escalated(&mut conversation, request, now);
            conversation.status = ConversationStatus::Escalated;
            if !write_conversation(&tx, &conversation)? {
                return Ok(None);
            }
            close_open_records(&tx, &request.conversation_id, now)?;

            let queue_length: i64 = tx.query_row(
                "SELECT COUNT(*) FROM escalations
                 WHERE department = ?1 AND outcome = 'queued' AND open = 1",
                params![plan.department],
                |row| row.get(0),
            )?;
            let position = queue_length + 1;
            let estimated_wait_minutes = base_wait + 10 * queue_length;
            let record = EscalationRecord {
                queue_position: Some(position),
                estimated_wait_minutes: Some(estimated_wait_minutes),
                open: true,
                ..new_record(request, plan, RecordOutcome::Queued, now)
            };
            insert_record(&tx, &record)?;
            tx.commit()?;
            Ok(Some(EscalationResult {
                plan: plan.clone(),
                outcome: EscalationOutcome::Queued {
                    position,
                    estimated_wait_minutes,
                },
                record,
            }))
        })?;
        info!(
            "escalation queued conversation_id={} department={} position={:?} wait_minutes={:?}",
            request.conversation_id,
            plan.department,
            result.record.queue_position,
            result.record.estimated_wait_minutes
        );
        Ok(result)
    }

    fn announce(&self, result: &EscalationResult, kind: AlertKind) {
        let agent_id = match &result.outcome {
            EscalationOutcome::Assigned { agent_id } => Some(agent_id.clone()),
            EscalationOutcome::Queued { .. } => None,
        };
        self.notify(&alert_for(result, kind, agent_id.clone()));

        let status = match kind {
            AlertKind::Queued => ConversationStatus::Escalated,
            _ => ConversationStatus::AgentAssigned,
        };
        let update = CaseUpdate {
            conversation_id: result.record.conversation_id.clone(),
            status: status.as_str().to_string(),
            department: result.plan.department.clone(),
            assigned_agent: agent_id,
            priority: result.plan.priority,
            reason: result.record.reason.clone(),
        };
        if let Err(err) = self.collaborators.tickets.sync_case(&update) {
            warn!(
                "ticket sync failed conversation_id={}: {}",
                update.conversation_id, err
            );
        }
    }

    fn notify(&self, alert: &AgentAlert) {
        if let Err(err) = self.collaborators.notifier.notify(alert) {
            warn!(
                "agent notification failed conversation_id={}: {}",
                alert.conversation_id, err
            );
        }
    }

    fn query_records<P: rusqlite::Params>(
        &self,
        filter: &str,
        params: P,
    ) -> Result<Vec<EscalationRecord>, StoreError> {
        let conn = self.db.connection()?;
        let sql = format!("SELECT {} FROM escalations WHERE {}", RECORD_COLUMNS, filter);
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params, RecordRow::from_row)?;
        let mut records = Vec::new();
        for row in rows {
            records.push(row?.into_record()?);
        }
        Ok(records)
    }
}

fn alert_for(result: &EscalationResult, kind: AlertKind, agent_id: Option<String>) -> AgentAlert {
    AgentAlert {
        kind,
        agent_id,
        department: result.plan.department.clone(),
        conversation_id: result.record.conversation_id.clone(),
        priority: result.plan.priority,
        contact_method: result.plan.contact_method,
        target_response_minutes: result.plan.target_response_minutes,
        reason: result.record.reason.clone(),
    }
}

fn mark_escalated(conversation: &mut Conversation, request: &EscalationRequest, now: DateTime<Utc>) {
    conversation.requires_human_intervention = true;
    conversation.escalation_reason = Some(request.reason.clone());
    conversation.escalated_at = Some(now);
    conversation.escalated_by = Some(request.actor.clone());
}

fn new_record(
    request: &EscalationRequest,
    plan: &EscalationPlan,
    outcome: RecordOutcome,
    now: DateTime<Utc>,
) -> EscalationRecord {
    EscalationRecord {
        id: Uuid::new_v4().to_string(),
        conversation_id: request.conversation_id.clone(),
        escalation_type: request.escalation_type,
        requester_role: request.requester_role,
        priority: plan.priority,
        department: plan.department.clone(),
        outcome,
        assigned_agent: None,
        queue_position: None,
        estimated_wait_minutes: None,
        target_response_minutes: plan.target_response_minutes,
        contact_method: plan.contact_method,
        reason: request.reason.clone(),
        actor: request.actor.clone(),
        open: false,
        created_at: now,
        closed_at: None,
    }
}

fn close_open_records(
    conn: &Connection,
    conversation_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, StoreError> {
    let closed = conn.execute(
        "UPDATE escalations SET open = 0, closed_at = ?2
         WHERE conversation_id = ?1 AND open = 1",
        params![conversation_id, format_datetime(now)],
    )?;
    Ok(closed)
}

fn insert_record(conn: &Connection, record: &EscalationRecord) -> Result<(), StoreError> {
    conn.execute(
        "INSERT INTO escalations (
            id, conversation_id, escalation_type, requester_role, priority, department,
            outcome, assigned_agent, queue_position, estimated_wait_minutes,
            target_response_minutes, contact_method, reason, actor, open, created_at, closed_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
        params![
            record.id,
            record.conversation_id,
            record.escalation_type.as_str(),
            record.requester_role.as_str(),
            record.priority.as_str(),
            record.department,
            record.outcome.as_str(),
            record.assigned_agent,
            record.queue_position,
            record.estimated_wait_minutes,
            record.target_response_minutes,
            record.contact_method.as_str(),
            record.reason,
            record.actor,
            bool_to_int(record.open),
            format_datetime(record.created_at),
            record.closed_at.map(format_datetime)
        ],
    )?;
    Ok(())
}

struct RecordRow {
    id: String,
    conversation_id: String,
    escalation_type: String,
    requester_role: String,
    priority: String,
    department: String,
    outcome: String,
    assigned_agent: Option<String>,
    queue_position: Option<i64>,
    estimated_wait_minutes: Option<i64>,
    target_response_minutes: i64,
    contact_method: String,
    reason: String,
    actor: String,
    open: i64,
    created_at: String,
    closed_at: Option<String>,
}

impl RecordRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            conversation_id: row.get(1)?,
            escalation_type: row.get(2)?,
            requester_role: row.get(3)?,
            priority: row.get(4)?,
            department: row.get(5)?,
            outcome: row.get(6)?,
            assigned_agent: row.get(7)?,
            queue_position: row.get(8)?,
            estimated_wait_minutes: row.get(9)?,
            target_response_minutes: row.get(10)?,
            contact_method: row.get(11)?,
            reason: row.get(12)?,
            actor: row.get(13)?,
            open: row.get(14)?,
            created_at: row.get(15)?,
            closed_at: row.get(16)?,
        })
    }

    fn into_record(self) -> Result<EscalationRecord, StoreError> {
        Ok(EscalationRecord {
            escalation_type: parse_label(&self.escalation_type)?,
            requester_role: parse_label(&self.requester_role)?,
            priority: parse_label(&self.priority)?,
            outcome: parse_label(&self.outcome)?,
            contact_method: parse_label(&self.contact_method)?,
            created_at: parse_datetime(&self.created_at)?,
            closed_at: parse_optional_datetime(self.closed_at.as_deref())?,
            open: self.open != 0,
            id: self.id,
            conversation_id: self.conversation_id,
            department: self.department,
            assigned_agent: self.assigned_agent,
            queue_position: self.queue_position,
            estimated_wait_minutes: self.estimated_wait_minutes,
            target_response_minutes: self.target_response_minutes,
            reason: self.reason,
            actor: self.actor,
        })
    }
}
