//! SQLite persistence for the ledger.
//!
//! Single-writer store: every reconciliation cycle runs inside one
//! `IMMEDIATE` transaction, serialized in-process by a mutex and across
//! processes by SQLite's write lock. Reads outside a cycle open their own
//! short-lived connection.

use rusqlite::{params, Connection, OpenFlags, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{LedgerError, Result};
use crate::logon_time::to_stored;
use crate::types::{ActiveSessionRecord, QuarantinedSession, Session, SessionKey, UserTotal};

pub struct Store {
    path: PathBuf,
    writer: Mutex<()>,
}

impl Store {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            path: path.into(),
            writer: Mutex::new(()),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Runs `op` inside a single write transaction.
    ///
    /// The transaction commits only if `op` returns `Ok`; any error rolls
    /// back every write made through the `StoreTx`.
    pub fn transaction<T>(&self, op: impl FnOnce(&StoreTx<'_>) -> Result<T>) -> Result<T> {
        let _guard = self
            .writer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut conn = self.open_connection()?;
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(LedgerError::storage("Failed to begin transaction"))?;
        let value = op(&StoreTx { conn: &tx })?;
        tx.commit()
            .map_err(LedgerError::storage("Failed to commit transaction"))?;
        Ok(value)
    }

    pub fn list_active_sessions(&self) -> Result<Vec<ActiveSessionRecord>> {
        self.with_connection(|conn| select_active_sessions(conn))
    }

    pub fn list_user_totals(&self) -> Result<Vec<UserTotal>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT username, total_minutes FROM user_totals \
                     ORDER BY total_minutes DESC, username ASC",
                )
                .map_err(LedgerError::storage("Failed to prepare totals query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(UserTotal {
                        username: row.get(0)?,
                        total_minutes: row.get(1)?,
                    })
                })
                .map_err(LedgerError::storage("Failed to query user totals"))?;

            let mut totals = Vec::new();
            for row in rows {
                totals.push(row.map_err(LedgerError::storage("Failed to decode total row"))?);
            }
            Ok(totals)
        })
    }

    pub fn user_total(&self, username: &str) -> Result<Option<i64>> {
        self.with_connection(|conn| {
            conn.query_row(
                "SELECT total_minutes FROM user_totals WHERE username = ?1",
                params![username],
                |row| row.get(0),
            )
            .optional()
            .map_err(LedgerError::storage("Failed to query user total"))
        })
    }

    pub fn list_quarantined(&self) -> Result<Vec<QuarantinedSession>> {
        self.with_connection(|conn| {
            let mut stmt = conn
                .prepare(
                    "SELECT host, session_id, username, logon_time, closed_at, reason \
                     FROM quarantined_sessions ORDER BY closed_at ASC, host ASC, session_id ASC",
                )
                .map_err(LedgerError::storage("Failed to prepare quarantine query"))?;
            let rows = stmt
                .query_map([], |row| {
                    Ok(QuarantinedSession {
                        host: row.get(0)?,
                        session_id: row.get(1)?,
                        username: row.get(2)?,
                        logon_time: row.get(3)?,
                        closed_at: row.get(4)?,
                        reason: row.get(5)?,
                    })
                })
                .map_err(LedgerError::storage("Failed to query quarantined sessions"))?;

            let mut entries = Vec::new();
            for row in rows {
                entries.push(row.map_err(LedgerError::storage("Failed to decode quarantine row"))?);
            }
            Ok(entries)
        })
    }

    fn init_schema(&self) -> Result<()> {
        self.with_connection(|conn| {
            conn.execute_batch(
                "BEGIN;
                 CREATE TABLE IF NOT EXISTS active_sessions (
                    host TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    logon_time TEXT NOT NULL,
                    PRIMARY KEY (host, session_id)
                 );
                 CREATE TABLE IF NOT EXISTS user_totals (
                    username TEXT PRIMARY KEY,
                    total_minutes INTEGER NOT NULL CHECK (total_minutes >= 0)
                 );
                 CREATE TABLE IF NOT EXISTS quarantined_sessions (
                    host TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    username TEXT NOT NULL,
                    logon_time TEXT NOT NULL,
                    closed_at TEXT NOT NULL,
                    reason TEXT NOT NULL
                 );
                 COMMIT;",
            )
            .map_err(LedgerError::storage("Failed to initialize schema"))
        })
    }

    pub(crate) fn with_connection<T>(&self, op: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let conn = self.open_connection()?;
        op(&conn)
    }

    fn open_connection(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs_err::create_dir_all(parent).map_err(|source| LedgerError::Io {
                    context: "Failed to create ledger data dir".to_string(),
                    source,
                })?;
            }
        }

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_FULL_MUTEX;

        let conn = Connection::open_with_flags(&self.path, flags)
            .map_err(LedgerError::storage("Failed to open sqlite db"))?;

        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(LedgerError::storage("Failed to enable WAL"))?;
        conn.pragma_update(None, "synchronous", "NORMAL")
            .map_err(LedgerError::storage("Failed to set synchronous"))?;
        conn.pragma_update(None, "busy_timeout", 5000)
            .map_err(LedgerError::storage("Failed to set busy_timeout"))?;

        Ok(conn)
    }
}

/// Write handle scoped to one `Store::transaction` call.
pub struct StoreTx<'a> {
    conn: &'a Connection,
}

impl StoreTx<'_> {
    pub fn active_sessions(&self) -> Result<Vec<ActiveSessionRecord>> {
        select_active_sessions(self.conn)
    }

    pub fn insert_active(&self, session: &Session) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO active_sessions (host, session_id, username, logon_time) \
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    session.host,
                    session.session_id,
                    session.username,
                    to_stored(session.logon_time)
                ],
            )
            .map_err(LedgerError::storage("Failed to insert active session"))?;
        Ok(())
    }

    pub fn delete_active(&self, key: &SessionKey) -> Result<()> {
        self.conn
            .execute(
                "DELETE FROM active_sessions WHERE host = ?1 AND session_id = ?2",
                params![key.host, key.session_id],
            )
            .map_err(LedgerError::storage("Failed to delete active session"))?;
        Ok(())
    }

    /// Adds `minutes` to the user's running total, creating the row if needed.
    pub fn add_minutes(&self, username: &str, minutes: i64) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO user_totals (username, total_minutes) VALUES (?1, ?2) \
                 ON CONFLICT(username) DO UPDATE SET \
                    total_minutes = user_totals.total_minutes + excluded.total_minutes",
                params![username, minutes.max(0)],
            )
            .map_err(LedgerError::storage("Failed to update user total"))?;
        Ok(())
    }

    pub fn quarantine(
        &self,
        record: &ActiveSessionRecord,
        closed_at: &str,
        reason: &str,
    ) -> Result<()> {
        self.conn
            .execute(
                "INSERT INTO quarantined_sessions \
                    (host, session_id, username, logon_time, closed_at, reason) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    record.host,
                    record.session_id,
                    record.username,
                    record.logon_time,
                    closed_at,
                    reason
                ],
            )
            .map_err(LedgerError::storage("Failed to quarantine session"))?;
        Ok(())
    }
}

fn select_active_sessions(conn: &Connection) -> Result<Vec<ActiveSessionRecord>> {
    let mut stmt = conn
        .prepare(
            "SELECT host, session_id, username, logon_time FROM active_sessions \
             ORDER BY host ASC, session_id ASC",
        )
        .map_err(LedgerError::storage("Failed to prepare active sessions query"))?;
    let rows = stmt
        .query_map([], |row| {
            Ok(ActiveSessionRecord {
                host: row.get(0)?,
                session_id: row.get(1)?,
                username: row.get(2)?,
                logon_time: row.get(3)?,
            })
        })
        .map_err(LedgerError::storage("Failed to query active sessions"))?;

    let mut sessions = Vec::new();
    for row in rows {
        sessions.push(row.map_err(LedgerError::storage("Failed to decode active session row"))?);
    }
    Ok(sessions)
}
