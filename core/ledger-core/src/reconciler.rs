//! Snapshot reconciliation: turns "is this session still present" into
//! logon/logoff bookkeeping and accumulated minutes.
//!
//! Each call runs in one store transaction:
//! - stored records on polled hosts that are no longer observed are closed
//!   out and their elapsed minutes added to the user's total,
//! - observed sessions with no stored record are opened using the logon time
//!   the host reported,
//! - sessions present on both sides are left alone, which keeps repeated
//!   observation idempotent.
//!
//! Records on hosts that did not answer this cycle are never touched.

use chrono::NaiveDateTime;
use serde::Serialize;
use std::collections::BTreeMap;
use tracing::{error, info, warn};

use crate::error::{LedgerError, Result};
use crate::filter::SessionFilter;
use crate::logon_time::{elapsed_minutes, parse_stored, to_stored};
use crate::store::{Store, StoreTx};
use crate::types::{ActiveSessionRecord, Session, SessionKey, Snapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The session disappeared from its host's listing.
    Ended,
    /// The host reused the session id for a different logon.
    Replaced,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OpenedSession {
    pub host: String,
    pub session_id: String,
    pub username: String,
    pub logon_time: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClosedSession {
    pub host: String,
    pub session_id: String,
    pub username: String,
    pub minutes: i64,
    /// False when the user is on the ignore list.
    pub counted: bool,
    pub reason: CloseReason,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CycleReport {
    pub opened: Vec<OpenedSession>,
    pub closed: Vec<ClosedSession>,
    pub quarantined: Vec<ActiveSessionRecord>,
    pub unchanged: usize,
    /// Stored records left alone because their host was not polled.
    pub deferred: usize,
}

impl CycleReport {
    pub fn is_noop(&self) -> bool {
        self.opened.is_empty() && self.closed.is_empty() && self.quarantined.is_empty()
    }

    pub fn minutes_added(&self) -> i64 {
        self.closed
            .iter()
            .filter(|closed| closed.counted)
            .map(|closed| closed.minutes)
            .sum()
    }
}

pub struct Reconciler<'a> {
    store: &'a Store,
    filter: &'a SessionFilter,
}

impl<'a> Reconciler<'a> {
    pub fn new(store: &'a Store, filter: &'a SessionFilter) -> Self {
        Self { store, filter }
    }

    /// Applies one filtered snapshot observed at `now`.
    ///
    /// Nothing is written unless the whole cycle succeeds.
    pub fn reconcile(&self, snapshot: &Snapshot, now: NaiveDateTime) -> Result<CycleReport> {
        let report = self.store.transaction(|tx| self.apply(tx, snapshot, now))?;
        log_report(&report);
        Ok(report)
    }

    fn apply(
        &self,
        tx: &StoreTx<'_>,
        snapshot: &Snapshot,
        now: NaiveDateTime,
    ) -> Result<CycleReport> {
        let mut report = CycleReport::default();
        let closed_at = to_stored(now);

        let stored: BTreeMap<SessionKey, ActiveSessionRecord> = tx
            .active_sessions()?
            .into_iter()
            .map(|record| (record.key(), record))
            .collect();

        let mut observed: BTreeMap<SessionKey, &Session> = BTreeMap::new();
        for session in &snapshot.sessions {
            if !snapshot.was_polled(&session.host) || self.filter.is_ignored(&session.username) {
                continue;
            }
            observed.entry(session.key()).or_insert(session);
        }

        for (key, record) in &stored {
            if !snapshot.was_polled(&record.host) {
                report.deferred += 1;
                continue;
            }
            if !observed.contains_key(key) {
                self.close_out(tx, record, now, &closed_at, CloseReason::Ended, &mut report)?;
            }
        }

        for (key, session) in &observed {
            match stored.get(key) {
                None => {}
                Some(record) if is_same_logon(record, session) => {
                    report.unchanged += 1;
                    continue;
                }
                Some(record) => {
                    // The old logon cannot have outlived the new one.
                    let ended_at = session.logon_time.min(now);
                    self.close_out(
                        tx,
                        record,
                        ended_at,
                        &closed_at,
                        CloseReason::Replaced,
                        &mut report,
                    )?;
                }
            }
            tx.insert_active(session)?;
            report.opened.push(OpenedSession {
                host: session.host.clone(),
                session_id: session.session_id.clone(),
                username: session.username.clone(),
                logon_time: to_stored(session.logon_time),
            });
        }

        Ok(report)
    }

    fn close_out(
        &self,
        tx: &StoreTx<'_>,
        record: &ActiveSessionRecord,
        ended_at: NaiveDateTime,
        closed_at: &str,
        reason: CloseReason,
        report: &mut CycleReport,
    ) -> Result<()> {
        let Some(logon_time) = parse_stored(&record.logon_time) else {
            let integrity = LedgerError::CorruptLogonTime {
                host: record.host.clone(),
                session_id: record.session_id.clone(),
                value: record.logon_time.clone(),
            };
            tx.quarantine(record, closed_at, &integrity.to_string())?;
            tx.delete_active(&record.key())?;
            report.quarantined.push(record.clone());
            return Ok(());
        };

        if ended_at < logon_time {
            warn!(
                host = %record.host,
                session_id = %record.session_id,
                username = %record.username,
                logon_time = %record.logon_time,
                ended_at = %to_stored(ended_at),
                "Logon time is after session end; counting zero minutes"
            );
        }

        let minutes = elapsed_minutes(logon_time, ended_at);
        let counted = !self.filter.is_ignored(&record.username);
        if counted {
            tx.add_minutes(&record.username, minutes)?;
        }
        tx.delete_active(&record.key())?;

        report.closed.push(ClosedSession {
            host: record.host.clone(),
            session_id: record.session_id.clone(),
            username: record.username.clone(),
            minutes,
            counted,
            reason,
        });
        Ok(())
    }
}

fn is_same_logon(record: &ActiveSessionRecord, session: &Session) -> bool {
    record.username == session.username && record.logon_time == to_stored(session.logon_time)
}

fn log_report(report: &CycleReport) {
    for closed in &report.closed {
        if closed.counted {
            info!(
                host = %closed.host,
                session_id = %closed.session_id,
                username = %closed.username,
                minutes = closed.minutes,
                reason = ?closed.reason,
                "Session completed"
            );
        } else {
            info!(
                host = %closed.host,
                session_id = %closed.session_id,
                username = %closed.username,
                reason = ?closed.reason,
                "Session completed for excluded user; not counted"
            );
        }
    }
    for record in &report.quarantined {
        error!(
            host = %record.host,
            session_id = %record.session_id,
            username = %record.username,
            logon_time = %record.logon_time,
            "Stored logon time is unreadable; session quarantined without counting"
        );
    }
    for opened in &report.opened {
        info!(
            host = %opened.host,
            session_id = %opened.session_id,
            username = %opened.username,
            logon_time = %opened.logon_time,
            "Session opened"
        );
    }
    if report.is_noop() {
        info!(
            unchanged = report.unchanged,
            deferred = report.deferred,
            "No session changes this cycle"
        );
    }
}
