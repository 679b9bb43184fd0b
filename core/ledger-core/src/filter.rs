//! Exclusion rules applied to raw poll results before reconciliation.

use std::collections::BTreeSet;
use tracing::{debug, info};

use crate::config::TrackerConfig;
use crate::types::Session;

#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    ignored_users: BTreeSet<String>,
}

impl SessionFilter {
    pub fn new(config: &TrackerConfig) -> Self {
        Self {
            ignored_users: config.ignore_set(),
        }
    }

    pub fn with_ignored<I, S>(users: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            ignored_users: users
                .into_iter()
                .map(|user| user.as_ref().trim().to_lowercase())
                .filter(|user| !user.is_empty())
                .collect(),
        }
    }

    pub fn is_ignored(&self, username: &str) -> bool {
        self.ignored_users.contains(&username.to_lowercase())
    }

    pub fn filter(&self, raw: Vec<Session>) -> Vec<Session> {
        raw.into_iter()
            .filter(|session| {
                if !is_user_session_id(&session.session_id) {
                    debug!(
                        host = %session.host,
                        username = %session.username,
                        session_id = %session.session_id,
                        "Ignoring system session"
                    );
                    return false;
                }
                if self.is_ignored(&session.username) {
                    info!(
                        host = %session.host,
                        username = %session.username,
                        session_id = %session.session_id,
                        "Ignoring session for excluded user"
                    );
                    return false;
                }
                true
            })
            .collect()
    }
}

/// User sessions carry a positive numeric id; session 0 and named ids
/// (`services`, `console`, ...) belong to the system.
pub fn is_user_session_id(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| c.is_ascii_digit())
        && value.chars().any(|c| c != '0')
}
