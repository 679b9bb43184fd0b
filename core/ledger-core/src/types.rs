//! Shared data model for polling and reconciliation.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeSet;

/// One user's logon on one host, as reported by a single poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub host: String,
    /// Host-scoped identifier; only unique together with `host`.
    pub session_id: String,
    pub username: String,
    pub state: String,
    /// Local wall-clock logon time reported by the host.
    pub logon_time: NaiveDateTime,
}

impl Session {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.host, &self.session_id)
    }
}

/// Composite identity of a session across the fleet.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionKey {
    pub host: String,
    pub session_id: String,
}

impl SessionKey {
    pub fn new(host: &str, session_id: &str) -> Self {
        Self {
            host: host.to_string(),
            session_id: session_id.to_string(),
        }
    }
}

/// Persisted row: a session observed active and not yet closed out.
///
/// `logon_time` is kept as the stored text so that corrupt rows can still be
/// loaded, reported, and quarantined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSessionRecord {
    pub host: String,
    pub session_id: String,
    pub username: String,
    pub logon_time: String,
}

impl ActiveSessionRecord {
    pub fn key(&self) -> SessionKey {
        SessionKey::new(&self.host, &self.session_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserTotal {
    pub username: String,
    pub total_minutes: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuarantinedSession {
    pub host: String,
    pub session_id: String,
    pub username: String,
    pub logon_time: String,
    pub closed_at: String,
    pub reason: String,
}

/// Sessions gathered from every host that answered in one cycle.
///
/// Hosts that failed are absent from `polled_hosts`; their stored records
/// must not be touched by reconciliation.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub polled_hosts: BTreeSet<String>,
    pub sessions: Vec<Session>,
}

impl Snapshot {
    pub fn record_host(&mut self, host: &str, sessions: Vec<Session>) {
        self.polled_hosts.insert(host.to_string());
        self.sessions.extend(sessions);
    }

    pub fn was_polled(&self, host: &str) -> bool {
        self.polled_hosts.contains(host)
    }
}
