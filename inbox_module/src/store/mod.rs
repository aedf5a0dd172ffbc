use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rand::Rng;
use rusqlite::{Connection, ErrorCode};
use tracing::debug;

mod leases;
mod migrations;
mod schema;

pub use leases::LeaseGuard;

use migrations::{ensure_agent_columns, ensure_conversation_columns, ensure_message_columns};
use schema::INBOX_SCHEMA;

pub(crate) const CONFLICT_RETRY_ATTEMPTS: u32 = 5;
const CONFLICT_BACKOFF_BASE: Duration = Duration::from_millis(20);

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("datetime parse error: {0}")]
    DateTimeParse(#[from] chrono::ParseError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },
    #[error("{entity} update conflicted after {attempts} attempts")]
    Conflict { entity: &'static str, attempts: u32 },
    #[error("invalid stored value: {0}")]
    Invalid(String),
}

impl StoreError {
    pub(crate) fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        StoreError::NotFound {
            entity,
            id: id.into(),
        }
    }

    fn is_busy(&self) -> bool {
        matches!(
            self,
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(err, _))
                if matches!(err.code, ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked)
        )
    }

    /// Conflicts and lock contention can succeed on a later attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Conflict { .. }) || self.is_busy()
    }
}

/// Handle to the SQLite database. Every operation opens its own connection.
#[derive(Debug, Clone)]
pub struct Database {
    path: Arc<PathBuf>,
}

impl Database {
    /// Opens (creating if needed) the database file, applying schema and migrations.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(&path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        let mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
        debug!("sqlite opened path={} journal_mode={}", path.display(), mode);
        conn.execute_batch(INBOX_SCHEMA)?;
        ensure_conversation_columns(&conn)?;
        ensure_message_columns(&conn)?;
        ensure_agent_columns(&conn)?;
        Ok(Self {
            path: Arc::new(path),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn connection(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(self.path.as_ref())?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }
}

/// Runs `attempt` until it reports success. `Ok(None)` signals a lost
/// optimistic-version race; busy errors are retried the same way.
pub(crate) fn retry_on_conflict<T>(
    entity: &'static str,
    mut attempt: impl FnMut() -> Result<Option<T>, StoreError>,
) -> Result<T, StoreError> {
    for n in 0..CONFLICT_RETRY_ATTEMPTS {
        match attempt() {
            Ok(Some(value)) => return Ok(value),
            Ok(None) => {}
            Err(err) if err.is_busy() => {
                debug!("{} busy on attempt {}: {}", entity, n + 1, err);
            }
            Err(err) => return Err(err),
        }
        if n + 1 < CONFLICT_RETRY_ATTEMPTS {
            thread::sleep(conflict_backoff(n));
        }
    }
    Err(StoreError::Conflict {
        entity,
        attempts: CONFLICT_RETRY_ATTEMPTS,
    })
}

fn conflict_backoff(attempt: u32) -> Duration {
    let base = CONFLICT_BACKOFF_BASE * 2u32.saturating_pow(attempt);
    let jitter_ms = rand::thread_rng().gen_range(0..=CONFLICT_BACKOFF_BASE.as_millis() as u64);
    base + Duration::from_millis(jitter_ms)
}

/// Fixed-width UTC timestamps so stored values also compare correctly as text.
pub(crate) fn format_datetime(value: DateTime<Utc>) -> String {
    value.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn parse_datetime(value: &str) -> Result<DateTime<Utc>, StoreError> {
    Ok(DateTime::parse_from_rfc3339(value)?.with_timezone(&Utc))
}

pub(crate) fn parse_optional_datetime(
    value: Option<&str>,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    match value {
        Some(raw) => Ok(Some(parse_datetime(raw)?)),
        None => Ok(None),
    }
}

pub(crate) fn bool_to_int(value: bool) -> i64 {
    if value {
        1
    } else {
        0
    }
}

pub(crate) fn parse_label<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, StoreError> {
    raw.parse::<T>().map_err(StoreError::Invalid)
}
