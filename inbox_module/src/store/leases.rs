use chrono::{Duration, Utc};
use rusqlite::params;
use tracing::warn;

use super::{format_datetime, Database, StoreError};

/// Exclusive reply rights on one conversation until released or expired.
#[derive(Debug)]
pub struct LeaseGuard {
    db: Database,
    conversation_id: String,
    holder: String,
    released: bool,
}

impl Database {
    /// Takes the lease when it is free, expired, or already ours.
    pub fn try_acquire_lease(
        &self,
        conversation_id: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LeaseGuard>, StoreError> {
        let conn = self.connection()?;
        let now = Utc::now();
        let changed = conn.execute(
            "INSERT INTO conversation_leases (conversation_id, holder, expires_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(conversation_id) DO UPDATE
                SET holder = excluded.holder, expires_at = excluded.expires_at
              WHERE conversation_leases.expires_at <= ?4
                 OR conversation_leases.holder = excluded.holder",
            params![
                conversation_id,
                holder,
                format_datetime(now + ttl),
                format_datetime(now)
            ],
        )?;
        if changed == 0 {
            return Ok(None);
        }
        Ok(Some(LeaseGuard {
            db: self.clone(),
            conversation_id: conversation_id.to_string(),
            holder: holder.to_string(),
            released: false,
        }))
    }
}

impl LeaseGuard {
    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn release(mut self) -> Result<(), StoreError> {
        self.released = true;
        self.delete_row()
    }

    fn delete_row(&self) -> Result<(), StoreError> {
        let conn = self.db.connection()?;
        conn.execute(
            "DELETE FROM conversation_leases WHERE conversation_id = ?1 AND holder = ?2",
            params![self.conversation_id, self.holder],
        )?;
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(err) = self.delete_row() {
            warn!(
                "failed to release lease conversation_id={}: {}",
                self.conversation_id, err
            );
        }
    }
}
