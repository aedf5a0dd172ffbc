use std::collections::HashSet;

use rusqlite::Connection;

use super::StoreError;

fn table_columns(conn: &Connection, table: &str) -> Result<HashSet<String>, StoreError> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(1))?;
    let mut columns = HashSet::new();
    for row in rows {
        columns.insert(row?);
    }
    Ok(columns)
}

/// Columns added after the first release of the conversations table.
pub(super) fn ensure_conversation_columns(conn: &Connection) -> Result<(), StoreError> {
    let columns = table_columns(conn, "conversations")?;

    if !columns.contains("escalated_by") {
        conn.execute("ALTER TABLE conversations ADD COLUMN escalated_by TEXT", [])?;
    }
    if !columns.contains("flow_state") {
        conn.execute("ALTER TABLE conversations ADD COLUMN flow_state TEXT", [])?;
    }
    if !columns.contains("version") {
        conn.execute(
            "ALTER TABLE conversations ADD COLUMN version INTEGER NOT NULL DEFAULT 0",
            [],
        )?;
    }
    Ok(())
}

pub(super) fn ensure_message_columns(conn: &Connection) -> Result<(), StoreError> {
    let columns = table_columns(conn, "messages")?;

    if !columns.contains("delivery_status") {
        conn.execute("ALTER TABLE messages ADD COLUMN delivery_status TEXT", [])?;
    }
    if !columns.contains("delivery_detail") {
        conn.execute("ALTER TABLE messages ADD COLUMN delivery_detail TEXT", [])?;
    }
    Ok(())
}

pub(super) fn ensure_agent_columns(conn: &Connection) -> Result<(), StoreError> {
    let columns = table_columns(conn, "agents")?;

    if !columns.contains("working_hours_start") {
        conn.execute("ALTER TABLE agents ADD COLUMN working_hours_start INTEGER", [])?;
    }
    if !columns.contains("working_hours_end") {
        conn.execute("ALTER TABLE agents ADD COLUMN working_hours_end INTEGER", [])?;
    }
    if !columns.contains("enabled") {
        conn.execute(
            "ALTER TABLE agents ADD COLUMN enabled INTEGER NOT NULL DEFAULT 1",
            [],
        )?;
    }
    Ok(())
}
