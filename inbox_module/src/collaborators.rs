//! Interfaces to systems outside the routing engine. Failures are logged by
//! the caller and never abort message handling.

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tracing::info;

use crate::channel::Platform;
use crate::escalation::{ContactMethod, Priority};

#[derive(Debug, thiserror::Error)]
#[error("{collaborator} failed: {detail}")]
pub struct CollaboratorError {
    pub collaborator: &'static str,
    pub detail: String,
}

/// Case state pushed to the ticket tracker, keyed by conversation id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CaseUpdate {
    pub conversation_id: String,
    pub status: String,
    pub department: String,
    pub assigned_agent: Option<String>,
    pub priority: Priority,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    Assigned,
    Queued,
    Reassigned,
    CustomerReplied,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentAlert {
    pub kind: AlertKind,
    /// `None` addresses the whole department (queued work).
    pub agent_id: Option<String>,
    pub department: String,
    pub conversation_id: String,
    pub priority: Priority,
    pub contact_method: ContactMethod,
    pub target_response_minutes: i64,
    pub reason: String,
}

pub trait TicketTracker: Send + Sync {
    fn sync_case(&self, update: &CaseUpdate) -> Result<(), CollaboratorError>;
}

pub trait AgentNotifier: Send + Sync {
    fn notify(&self, alert: &AgentAlert) -> Result<(), CollaboratorError>;
}

pub trait CustomerDataSource: Send + Sync {
    fn lookup(&self, platform: Platform, customer_id: &str)
        -> Result<Option<Value>, CollaboratorError>;
}

#[derive(Debug, Default)]
pub struct LoggingTicketTracker;

impl TicketTracker for LoggingTicketTracker {
    fn sync_case(&self, update: &CaseUpdate) -> Result<(), CollaboratorError> {
        info!(
            "case sync conversation_id={} status={} department={} agent={:?}",
            update.conversation_id, update.status, update.department, update.assigned_agent
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct LoggingNotifier;

impl AgentNotifier for LoggingNotifier {
    fn notify(&self, alert: &AgentAlert) -> Result<(), CollaboratorError> {
        info!(
            "agent alert kind={:?} agent={:?} department={} conversation_id={} priority={}",
            alert.kind, alert.agent_id, alert.department, alert.conversation_id, alert.priority
        );
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoCustomerData;

impl CustomerDataSource for NoCustomerData {
    fn lookup(
        &self,
        _platform: Platform,
        _customer_id: &str,
    ) -> Result<Option<Value>, CollaboratorError> {
        Ok(None)
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub tickets: Arc<dyn TicketTracker>,
    pub notifier: Arc<dyn AgentNotifier>,
    pub customer_data: Arc<dyn CustomerDataSource>,
}

impl Default for Collaborators {
    fn default() -> Self {
        Self {
            tickets: Arc::new(LoggingTicketTracker),
            notifier: Arc::new(LoggingNotifier),
            customer_data: Arc::new(NoCustomerData),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators").finish_non_exhaustive()
    }
}
