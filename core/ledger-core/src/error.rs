//! Error types for ledger-core operations.

use std::path::PathBuf;

/// Errors that stop an operation outright: bad configuration, storage
/// failures, and stored data that cannot be trusted.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file not found: {0}")]
    ConfigNotFound(PathBuf),

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid configuration: {0}")]
    ConfigInvalid(String),

    #[error("Home directory not found")]
    HomeDirNotFound,

    // ─────────────────────────────────────────────────────────────────────
    // Storage Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Storage error: {context}: {source}")]
    Storage {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Corrupt stored logon time for {host}/{session_id}: {value:?}")]
    CorruptLogonTime {
        host: String,
        session_id: String,
        value: String,
    },

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LedgerError {
    pub(crate) fn storage(context: impl Into<String>) -> impl FnOnce(rusqlite::Error) -> Self {
        let context = context.into();
        move |source| LedgerError::Storage { context, source }
    }
}

/// Convenience type alias for Results using LedgerError.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Per-host failure while enumerating sessions.
///
/// None of these abort a cycle; the host is left out of the snapshot and
/// retried on the next cycle.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("failed to launch {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("exited with {status}: {stderr}")]
    ExitStatus { status: String, stderr: String },

    #[error("output exceeded {limit} bytes")]
    OutputTooLarge { limit: u64 },

    #[error("unexpected output on line {line}: {details}")]
    Parse { line: usize, details: String },

    #[error("I/O error while reading output: {0}")]
    Io(#[from] std::io::Error),
}

impl From<LedgerError> for String {
    fn from(err: LedgerError) -> String {
        err.to_string()
    }
}
