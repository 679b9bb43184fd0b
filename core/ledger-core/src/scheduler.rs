//! Fixed-interval poll/reconcile loop.
//!
//! Each cycle fans out one fetch per host on scoped threads, waits for all of
//! them (timeouts are enforced by the source), filters what came back, and
//! hands the merged snapshot to the reconciler. Hosts that failed are left
//! out of the snapshot so their stored sessions stay open.

use chrono::{Local, NaiveDateTime};
use std::thread;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::config::TrackerConfig;
use crate::error::FetchError;
use crate::filter::SessionFilter;
use crate::reconciler::{CycleReport, Reconciler};
use crate::shutdown::Shutdown;
use crate::source::SessionSource;
use crate::store::Store;
use crate::types::{Session, Snapshot};

#[derive(Debug, Clone, Default)]
pub struct CycleSummary {
    pub polled_hosts: Vec<String>,
    pub failed_hosts: Vec<String>,
    /// `None` when the reconciliation transaction failed and was rolled back.
    pub report: Option<CycleReport>,
}

pub struct Scheduler<'a, S: SessionSource> {
    config: &'a TrackerConfig,
    source: S,
    filter: SessionFilter,
    store: &'a Store,
}

impl<'a, S: SessionSource> Scheduler<'a, S> {
    pub fn new(config: &'a TrackerConfig, source: S, store: &'a Store) -> Self {
        Self {
            config,
            source,
            filter: SessionFilter::new(config),
            store,
        }
    }

    /// Runs cycles until `shutdown` is requested.
    ///
    /// The flag is checked before each cycle and during the wait between
    /// cycles; an in-flight cycle always runs to completion.
    pub fn run(&self, shutdown: &Shutdown) {
        let interval = self.config.poll_interval();
        info!(
            hosts = ?self.config.hosts,
            interval_secs = interval.as_secs(),
            "Scheduler started"
        );

        let mut cycle: u64 = 0;
        while !shutdown.is_requested() {
            cycle += 1;
            info!(cycle, "Starting check cycle");
            let started = Instant::now();
            let summary = self.run_cycle();

            let wait = interval.saturating_sub(started.elapsed());
            info!(
                cycle,
                polled = summary.polled_hosts.len(),
                failed = summary.failed_hosts.len(),
                reconciled = summary.report.is_some(),
                wait_secs = wait.as_secs(),
                "Cycle finished"
            );
            if shutdown.sleep(wait) {
                break;
            }
        }

        info!(cycles = cycle, "Scheduler stopped");
    }

    /// Polls every host and reconciles against the local clock.
    pub fn run_cycle(&self) -> CycleSummary {
        let snapshot = self.poll();
        // Sample the clock after the fetch barrier so closeouts are timed
        // at the moment absence was confirmed.
        let now = Local::now().naive_local();
        self.reconcile(snapshot, now)
    }

    /// Same as `run_cycle` with an explicit observation time.
    pub fn run_cycle_at(&self, now: NaiveDateTime) -> CycleSummary {
        let snapshot = self.poll();
        self.reconcile(snapshot, now)
    }

    pub fn poll(&self) -> Snapshot {
        let results: Vec<(&String, Result<Vec<Session>, FetchError>)> = thread::scope(|scope| {
            let handles: Vec<_> = self
                .config
                .hosts
                .iter()
                .map(|host| (host, scope.spawn(move || self.source.fetch(host))))
                .collect();

            handles
                .into_iter()
                .map(|(host, handle)| {
                    let result = handle.join().unwrap_or_else(|_| {
                        Err(FetchError::Io(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            "fetch thread panicked",
                        )))
                    });
                    (host, result)
                })
                .collect()
        });

        let mut snapshot = Snapshot::default();
        for (host, result) in results {
            match result {
                Ok(sessions) => {
                    let raw = sessions.len();
                    let kept = self.filter.filter(sessions);
                    info!(host = %host, raw, kept = kept.len(), "Host polled");
                    snapshot.record_host(host, kept);
                }
                Err(err) => {
                    warn!(
                        host = %host,
                        error = %err,
                        "Failed to fetch sessions; host skipped this cycle"
                    );
                }
            }
        }
        snapshot
    }

    fn reconcile(&self, snapshot: Snapshot, now: NaiveDateTime) -> CycleSummary {
        let polled_hosts: Vec<String> = snapshot.polled_hosts.iter().cloned().collect();
        let failed_hosts: Vec<String> = self
            .config
            .hosts
            .iter()
            .filter(|host| !snapshot.was_polled(host))
            .cloned()
            .collect();

        let report = match Reconciler::new(self.store, &self.filter).reconcile(&snapshot, now) {
            Ok(report) => Some(report),
            Err(err) => {
                error!(
                    error = %err,
                    "Reconciliation failed; cycle rolled back and will be retried"
                );
                None
            }
        };

        CycleSummary {
            polled_hosts,
            failed_hosts,
            report,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logon_time::parse_reported;
    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    fn at(value: &str) -> NaiveDateTime {
        parse_reported(value, "%d.%m.%Y %H:%M").expect("timestamp")
    }

    fn session(host: &str, session_id: &str, username: &str, logon: &str) -> Session {
        Session {
            host: host.to_string(),
            session_id: session_id.to_string(),
            username: username.to_string(),
            state: "Active".to_string(),
            logon_time: at(logon),
        }
    }

    enum Reply {
        Sessions(Vec<Session>),
        Fail,
    }

    #[derive(Default)]
    struct FakeSource {
        replies: Mutex<HashMap<String, VecDeque<Reply>>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
        stop_after_fetch: Option<Shutdown>,
    }

    impl FakeSource {
        fn script(self, host: &str, replies: Vec<Reply>) -> Self {
            self.replies
                .lock()
                .expect("lock replies")
                .insert(host.to_string(), replies.into());
            self
        }
    }

    impl SessionSource for FakeSource {
        fn fetch(&self, host: &str) -> Result<Vec<Session>, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                thread::sleep(delay);
            }
            if let Some(shutdown) = &self.stop_after_fetch {
                shutdown.request();
            }
            let reply = self
                .replies
                .lock()
                .expect("lock replies")
                .get_mut(host)
                .and_then(|queue| queue.pop_front());
            match reply {
                Some(Reply::Sessions(sessions)) => Ok(sessions),
                Some(Reply::Fail) | None => Err(FetchError::Timeout { secs: 30 }),
            }
        }
    }

    fn store() -> (tempfile::TempDir, Store) {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let store = Store::open(temp_dir.path().join("sessions.db")).expect("store init");
        (temp_dir, store)
    }

    #[test]
    fn failing_host_does_not_disturb_other_hosts() {
        let (_dir, store) = store();
        let config = TrackerConfig::for_hosts(&["ts01", "ts02"]);
        let source = FakeSource::default()
            .script(
                "ts01",
                vec![
                    Reply::Sessions(vec![session("ts01", "5", "alice", "01.01.2025 09:00")]),
                    Reply::Sessions(vec![]),
                ],
            )
            .script(
                "ts02",
                vec![
                    Reply::Sessions(vec![session("ts02", "5", "bob", "01.01.2025 09:00")]),
                    Reply::Fail,
                ],
            );
        let scheduler = Scheduler::new(&config, source, &store);

        let first = scheduler.run_cycle_at(at("01.01.2025 09:01"));
        assert_eq!(first.polled_hosts, vec!["ts01", "ts02"]);
        assert_eq!(first.report.expect("report").opened.len(), 2);

        let second = scheduler.run_cycle_at(at("01.01.2025 09:20"));
        assert_eq!(second.polled_hosts, vec!["ts01"]);
        assert_eq!(second.failed_hosts, vec!["ts02"]);
        let report = second.report.expect("report");
        assert_eq!(report.closed.len(), 1);
        assert_eq!(report.deferred, 1);

        assert_eq!(store.user_total("alice").expect("total"), Some(20));
        assert_eq!(store.user_total("bob").expect("total"), None);
        let active = store.list_active_sessions().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].host, "ts02");
    }

    #[test]
    fn filter_runs_before_reconciliation() {
        let (_dir, store) = store();
        let config = TrackerConfig::for_hosts(&["ts01"]);
        let source = FakeSource::default().script(
            "ts01",
            vec![Reply::Sessions(vec![
                session("ts01", "1", "admin", "01.01.2025 08:00"),
                session("ts01", "0", "system", "01.01.2025 08:00"),
                session("ts01", "2", "alice", "01.01.2025 08:30"),
            ])],
        );
        let scheduler = Scheduler::new(&config, source, &store);

        scheduler.run_cycle_at(at("01.01.2025 09:00"));
        let active = store.list_active_sessions().expect("active");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].username, "alice");
    }

    #[test]
    fn run_does_not_start_a_cycle_after_shutdown() {
        let (_dir, store) = store();
        let config = TrackerConfig::for_hosts(&["ts01"]);
        let scheduler = Scheduler::new(&config, FakeSource::default(), &store);

        let shutdown = Shutdown::new();
        shutdown.request();
        scheduler.run(&shutdown);
        assert_eq!(scheduler.source.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn shutdown_mid_cycle_still_completes_reconciliation() {
        let (_dir, store) = store();
        let mut config = TrackerConfig::for_hosts(&["ts01"]);
        config.poll_interval_secs = 3600;
        let shutdown = Shutdown::new();
        let source = FakeSource {
            stop_after_fetch: Some(shutdown.clone()),
            ..FakeSource::default()
        }
        .script(
            "ts01",
            vec![Reply::Sessions(vec![session(
                "ts01",
                "5",
                "alice",
                "01.01.2025 09:00",
            )])],
        );
        let scheduler = Scheduler::new(&config, source, &store);

        let started = Instant::now();
        scheduler.run(&shutdown);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(scheduler.source.calls.load(Ordering::SeqCst), 1);
        assert_eq!(store.list_active_sessions().expect("active").len(), 1);
    }

    #[test]
    fn hosts_are_fetched_concurrently() {
        let (_dir, store) = store();
        let config = TrackerConfig::for_hosts(&["ts01", "ts02", "ts03", "ts04"]);
        let source = FakeSource {
            delay: Some(Duration::from_millis(400)),
            ..FakeSource::default()
        };
        let scheduler = Scheduler::new(&config, source, &store);

        let started = Instant::now();
        let summary = scheduler.run_cycle_at(at("01.01.2025 09:00"));
        assert!(started.elapsed() < Duration::from_millis(1500));
        assert_eq!(summary.failed_hosts.len(), 4);
        assert_eq!(scheduler.source.calls.load(Ordering::SeqCst), 4);
    }
}
