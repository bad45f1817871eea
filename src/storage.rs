//! Config entry persistence via SQLite + WAL
//!
//! The only state that survives a restart is the list of config entries.
//! Weather payloads are never written to disk.

use std::path::Path;
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use rusqlite::{params, Connection};

use crate::entries::ConfigEntry;
use crate::integrations::openweather::config_flow::OptionsInput;

/// True when `err` is a `unique_id` (or primary key) constraint violation.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<rusqlite::Error>(),
        Some(rusqlite::Error::SqliteFailure(e, _)) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Open (or create) the SQLite database with WAL mode.
fn open_db(path: &Path) -> rusqlite::Result<Connection> {
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "journal_mode", "wal")?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.pragma_update(None, "busy_timeout", 5000)?;

    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS config_entries (
            entry_id   TEXT PRIMARY KEY,
            domain     TEXT NOT NULL,
            title      TEXT NOT NULL,
            unique_id  TEXT NOT NULL UNIQUE,
            data       TEXT NOT NULL,
            options    TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );",
    )?;

    Ok(conn)
}

pub struct EntryStore {
    conn: Mutex<Connection>,
}

impl EntryStore {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let conn = open_db(path)
            .with_context(|| format!("failed to open entry store at {}", path.display()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// All persisted entries, oldest first.
    pub fn load_all(&self) -> anyhow::Result<Vec<ConfigEntry>> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = conn.prepare(
            "SELECT entry_id, domain, title, unique_id, data, options, created_at
             FROM config_entries ORDER BY created_at ASC",
        )?;

        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, String>(6)?,
            ))
        })?;

        let mut entries = Vec::new();
        for row in rows {
            let (entry_id, domain, title, unique_id, data, options, created_at) = row?;
            let entry = ConfigEntry {
                data: serde_json::from_str(&data)
                    .with_context(|| format!("corrupt data for entry {}", entry_id))?,
                options: serde_json::from_str(&options).unwrap_or_else(|e| {
                    tracing::warn!(entry_id = %entry_id, error = %e, "Corrupt options, using defaults");
                    OptionsInput::default()
                }),
                created_at: chrono::DateTime::parse_from_rfc3339(&created_at)
                    .map(|ts| ts.with_timezone(&chrono::Utc))
                    .unwrap_or_else(|e| {
                        tracing::warn!(entry_id = %entry_id, error = %e, "Corrupt created_at, using now");
                        chrono::Utc::now()
                    }),
                entry_id,
                domain,
                title,
                unique_id,
            };
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Insert or replace an entry.
    pub fn upsert(&self, entry: &ConfigEntry) -> anyhow::Result<()> {
        let data = serde_json::to_string(&entry.data)?;
        let options = serde_json::to_string(&entry.options)?;
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT INTO config_entries (entry_id, domain, title, unique_id, data, options, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT(entry_id) DO UPDATE SET
                title = excluded.title,
                unique_id = excluded.unique_id,
                data = excluded.data,
                options = excluded.options",
            params![
                entry.entry_id,
                entry.domain,
                entry.title,
                entry.unique_id,
                data,
                options,
                entry.created_at.to_rfc3339(),
            ],
        )
        .with_context(|| format!("failed to store entry {}", entry.entry_id))?;
        Ok(())
    }

    /// Delete an entry. Returns true if it existed.
    pub fn remove(&self, entry_id: &str) -> anyhow::Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let n = conn.execute(
            "DELETE FROM config_entries WHERE entry_id = ?1",
            params![entry_id],
        )?;
        Ok(n > 0)
    }
}
