use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::types::{Agent, AgentStatus, WorkingHours};
use crate::store::{
    bool_to_int, format_datetime, parse_label, parse_optional_datetime, Database, StoreError,
};

const AGENT_COLUMNS: &str = "id, name, department, current_workload, max_concurrent, status, \
     specializations, last_assignment, working_hours_start, working_hours_end, enabled";

/// Agent roster and workload counters. Workload only moves through
/// conditional updates.
#[derive(Debug, Clone)]
pub struct AgentStore {
    db: Database,
}

impl AgentStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Inserts or updates the agent profile. The workload counter and last
    /// assignment of an existing agent are left alone.
    pub fn upsert(&self, agent: &Agent) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        conn.execute(
            "INSERT INTO agents (
                id, name, department, current_workload, max_concurrent, status,
                specializations, last_assignment, working_hours_start, working_hours_end, enabled
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(id) DO UPDATE SET
                name = excluded.name,
                department = excluded.department,
                max_concurrent = excluded.max_concurrent,
                status = excluded.status,
                specializations = excluded.specializations,
                working_hours_start = excluded.working_hours_start,
                working_hours_end = excluded.working_hours_end,
                enabled = excluded.enabled",
            params![
                agent.id,
                agent.name,
                agent.department,
                agent.current_workload.max(0),
                agent.max_concurrent,
                agent.status.as_str(),
                serde_json::to_string(&agent.specializations)?,
                agent.last_assignment.map(format_datetime),
                agent.working_hours.map(|hours| hours.start_hour),
                agent.working_hours.map(|hours| hours.end_hour),
                bool_to_int(agent.enabled)
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<Agent>, StoreError> {
        let conn = self.db.connection()?;
        load_agent(&conn, id)
    }

    pub fn list_department(&self, department: &str) -> Result<Vec<Agent>, StoreError> {
        let conn = self.db.connection()?;
        let sql = format!(
            "SELECT {} FROM agents WHERE department = ?1 ORDER BY id",
            AGENT_COLUMNS
        );
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params![department], AgentRow::from_row)?;
        let mut agents = Vec::new();
        for row in rows {
            agents.push(row?.into_agent()?);
        }
        Ok(agents)
    }

    pub fn set_status(&self, id: &str, status: AgentStatus) -> Result<(), StoreError> {
        self.update_one(
            "UPDATE agents SET status = ?2 WHERE id = ?1",
            id,
            params![id, status.as_str()],
        )
    }

    pub fn set_enabled(&self, id: &str, enabled: bool) -> Result<(), StoreError> {
        self.update_one(
            "UPDATE agents SET enabled = ?2 WHERE id = ?1",
            id,
            params![id, bool_to_int(enabled)],
        )
    }

    pub fn set_working_hours(
        &self,
        id: &str,
        hours: Option<WorkingHours>,
    ) -> Result<(), StoreError> {
        self.update_one(
            "UPDATE agents SET working_hours_start = ?2, working_hours_end = ?3 WHERE id = ?1",
            id,
            params![
                id,
                hours.map(|h| h.start_hour),
                hours.map(|h| h.end_hour)
            ],
        )
    }

    /// Takes one unit of the agent's capacity. Returns false when the agent
    /// is full or no longer available.
    pub fn try_claim(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.connection()?;
        try_claim(&conn, id)
    }

    pub fn release(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.db.connection()?;
        release(&conn, id)
    }

    fn update_one<P: rusqlite::Params>(
        &self,
        sql: &str,
        id: &str,
        params: P,
    ) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        if conn.execute(sql, params)? == 0 {
            return Err(StoreError::not_found("agent", id));
        }
        Ok(())
    }
}

pub(crate) fn try_claim(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE agents SET current_workload = current_workload + 1
         WHERE id = ?1
           AND enabled = 1
           AND status = 'available'
           AND current_workload < max_concurrent",
        params![id],
    )?;
    if changed == 0 {
        debug!("agent claim lost agent_id={}", id);
    }
    Ok(changed == 1)
}

/// Runs inside the assignment transaction, so a claim that is rolled back
/// never moves the agent's place in the rotation.
pub(crate) fn stamp_assignment(
    conn: &Connection,
    id: &str,
    at: DateTime<Utc>,
) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE agents SET last_assignment = ?2 WHERE id = ?1",
        params![id, format_datetime(at)],
    )?;
    Ok(())
}

pub(crate) fn release(conn: &Connection, id: &str) -> Result<bool, StoreError> {
    let changed = conn.execute(
        "UPDATE agents SET current_workload = current_workload - 1
         WHERE id = ?1 AND current_workload > 0",
        params![id],
    )?;
    Ok(changed == 1)
}

fn load_agent(conn: &Connection, id: &str) -> Result<Option<Agent>, StoreError> {
    let sql = format!("SELECT {} FROM agents WHERE id = ?1", AGENT_COLUMNS);
    conn.query_row(&sql, params![id], AgentRow::from_row)
        .optional()?
        .map(AgentRow::into_agent)
        .transpose()
}

struct AgentRow {
    id: String,
    name: String,
    department: String,
    current_workload: i64,
    max_concurrent: i64,
    status: String,
    specializations: String,
    last_assignment: Option<String>,
    working_hours_start: Option<u32>,
    working_hours_end: Option<u32>,
    enabled: i64,
}

impl AgentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            department: row.get(2)?,
            current_workload: row.get(3)?,
            max_concurrent: row.get(4)?,
            status: row.get(5)?,
            specializations: row.get(6)?,
            last_assignment: row.get(7)?,
            working_hours_start: row.get(8)?,
            working_hours_end: row.get(9)?,
            enabled: row.get(10)?,
        })
    }

    fn into_agent(self) -> Result<Agent, StoreError> {
        let working_hours = match (self.working_hours_start, self.working_hours_end) {
            (Some(start_hour), Some(end_hour)) => Some(WorkingHours {
                start_hour,
                end_hour,
            }),
            _ => None,
        };
        Ok(Agent {
            status: parse_label(&self.status)?,
            specializations: serde_json::from_str(&self.specializations)?,
            last_assignment: parse_optional_datetime(self.last_assignment.as_deref())?,
            enabled: self.enabled != 0,
            id: self.id,
            name: self.name,
            department: self.department,
            current_workload: self.current_workload,
            max_concurrent: self.max_concurrent,
            working_hours,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;
    use tempfile::TempDir;

    fn store() -> (TempDir, AgentStore) {
        let temp = TempDir::new().expect("tempdir");
        let db = Database::open(temp.path().join("inbox.db")).expect("open");
        (temp, AgentStore::new(db))
    }

    #[test]
    fn upsert_keeps_live_workload() {
        let (_temp, store) = store();
        let mut agent = Agent::new("agent-1", "billing_support");
        agent.specializations = vec!["billing".to_string()];
        store.upsert(&agent).expect("insert");
        assert!(store.try_claim("agent-1").expect("claim"));

        agent.name = "Alex".to_string();
        store.upsert(&agent).expect("update");
        let stored = store.get("agent-1").expect("get").expect("agent");
        assert_eq!(stored.name, "Alex");
        assert_eq!(stored.current_workload, 1);
        assert!(stored.last_assignment.is_none());
        assert_eq!(stored.specializations, vec!["billing"]);
    }

    #[test]
    fn claims_respect_capacity_and_status() {
        let (_temp, store) = store();
        let mut agent = Agent::new("agent-1", "customer_support");
        agent.max_concurrent = 1;
        store.upsert(&agent).expect("insert");

        assert!(store.try_claim("agent-1").expect("claim"));
        assert!(!store.try_claim("agent-1").expect("full"));
        assert!(store.release("agent-1").expect("release"));
        assert!(!store.release("agent-1").expect("guarded release"));

        store.set_status("agent-1", AgentStatus::Away).expect("status");
        assert!(!store.try_claim("agent-1").expect("away"));
    }

    #[test]
    fn claims_alone_do_not_move_rotation() {
        let (_temp, store) = store();
        store
            .upsert(&Agent::new("agent-1", "customer_support"))
            .expect("insert");

        assert!(store.try_claim("agent-1").expect("claim"));
        assert!(store.release("agent-1").expect("release"));
        let stored = store.get("agent-1").expect("get").expect("agent");
        assert_eq!(stored.current_workload, 0);
        assert!(stored.last_assignment.is_none());
    }

    #[test]
    fn concurrent_claims_never_exceed_capacity() {
        let (_temp, store) = store();
        let mut agent = Agent::new("agent-1", "customer_support");
        agent.max_concurrent = 3;
        store.upsert(&agent).expect("insert");

        let barrier = Arc::new(Barrier::new(10));
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = store.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    store.try_claim("agent-1").expect("claim")
                })
            })
            .collect();
        let claimed = handles
            .into_iter()
            .map(|handle| handle.join().expect("join"))
            .filter(|won| *won)
            .count();
        assert_eq!(claimed, 3);
        let stored = store.get("agent-1").expect("get").expect("agent");
        assert_eq!(stored.current_workload, 3);
    }

    #[test]
    fn status_change_on_missing_agent_is_not_found() {
        let (_temp, store) = store();
        assert!(matches!(
            store.set_status("ghost", AgentStatus::Offline),
            Err(StoreError::NotFound { entity: "agent", .. })
        ));
    }
}
