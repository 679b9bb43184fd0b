//! Core library for Logon Ledger.
//!
//! Polls a fleet of hosts for their active logon sessions, reconciles each
//! snapshot against the sessions recorded in SQLite, and accumulates per-user
//! minutes when sessions disappear.
//!
//! ## Pipeline
//!
//! ```text
//! Scheduler ──► SessionSource (per host, concurrent)
//!                 │
//!                 ▼
//!           SessionFilter ──► Snapshot ──► Reconciler ──► Store (one transaction)
//! ```
//!
//! Only hosts that answered contribute to a snapshot; sessions recorded for a
//! silent host stay open until that host answers again.

pub mod config;
pub mod error;
pub mod filter;
pub mod logon_time;
pub mod reconciler;
pub mod scheduler;
pub mod shutdown;
pub mod source;
pub mod store;
pub mod types;

pub use config::{load_config, SourceConfig, SourceFormat, TrackerConfig};
pub use error::{FetchError, LedgerError, Result};
pub use filter::SessionFilter;
pub use reconciler::{CloseReason, CycleReport, Reconciler};
pub use scheduler::{CycleSummary, Scheduler};
pub use shutdown::{install_signal_handlers, Shutdown};
pub use source::{CommandSessionSource, SessionSource};
pub use store::Store;
pub use types::{ActiveSessionRecord, QuarantinedSession, Session, SessionKey, Snapshot, UserTotal};
