use std::time::{Duration, Instant};

use dashmap::{mapref::entry::Entry, DashMap};
use rand::{distributions::Alphanumeric, Rng};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{debug, info};
use uuid::Uuid;

use crate::{
    auth::repo_types::{Role, User},
    config::{SessionConfig, SessionPolicy},
};

pub const SESSION_COOKIE: &str = "SESSION";
const SESSION_ID_LEN: usize = 48;

#[derive(Debug, Clone)]
pub struct Session {
    pub id: String,
    pub user_id: Uuid,
    pub username: String,
    pub role: Role,
    pub created_at: OffsetDateTime,
    last_seen: Instant,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("user already holds an active session")]
    LimitReached,
}

pub fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Live sessions plus a one-slot index per user, which is what enforces the
/// single-session policy.
///
/// Lock order: a `by_user` entry may be held while touching `sessions`, never
/// the other way round.
#[derive(Debug)]
pub struct SessionRegistry {
    sessions: DashMap<String, Session>,
    by_user: DashMap<String, String>,
    policy: SessionPolicy,
    idle_timeout: Duration,
}

impl SessionRegistry {
    pub fn new(config: &SessionConfig) -> Self {
        Self {
            sessions: DashMap::new(),
            by_user: DashMap::new(),
            policy: config.policy,
            idle_timeout: config.idle_timeout,
        }
    }

    fn is_live(&self, session: &Session, now: Instant) -> bool {
        now.saturating_duration_since(session.last_seen) < self.idle_timeout
    }

    pub fn issue(&self, user: &User) -> Result<Session, SessionError> {
        self.issue_at(user, Instant::now())
    }

    pub fn issue_at(&self, user: &User, now: Instant) -> Result<Session, SessionError> {
        let session = Session {
            id: random_token(SESSION_ID_LEN),
            user_id: user.id,
            username: user.username.clone(),
            role: user.role,
            created_at: OffsetDateTime::now_utc(),
            last_seen: now,
        };

        match self.by_user.entry(user.username.clone()) {
            Entry::Occupied(mut slot) => {
                let prior_live = self
                    .sessions
                    .get(slot.get())
                    .map(|s| self.is_live(&s, now))
                    .unwrap_or(false);
                if prior_live && self.policy == SessionPolicy::RejectNew {
                    return Err(SessionError::LimitReached);
                }
                self.sessions.insert(session.id.clone(), session.clone());
                let prior = slot.insert(session.id.clone());
                self.sessions.remove(&prior);
                if prior_live {
                    info!(username = %user.username, "previous session evicted by new login");
                }
            }
            Entry::Vacant(slot) => {
                self.sessions.insert(session.id.clone(), session.clone());
                slot.insert(session.id.clone());
            }
        }
        debug!(username = %user.username, "session issued");
        Ok(session)
    }

    pub fn resolve(&self, id: &str) -> Option<Session> {
        self.resolve_at(id, Instant::now())
    }

    /// Look up a session and mark it as used. Idle sessions are dropped on sight.
    pub fn resolve_at(&self, id: &str, now: Instant) -> Option<Session> {
        let expired = {
            let mut session = self.sessions.get_mut(id)?;
            if self.is_live(&session, now) {
                session.last_seen = now;
                return Some(session.clone());
            }
            session.username.clone()
        };
        self.remove(id, &expired);
        None
    }

    pub fn invalidate(&self, id: &str) -> Option<Session> {
        let (_, session) = self.sessions.remove(id)?;
        self.by_user
            .remove_if(&session.username, |_, current| current == id);
        Some(session)
    }

    fn remove(&self, id: &str, username: &str) {
        self.sessions.remove(id);
        self.by_user.remove_if(username, |_, current| current == id);
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let expired: Vec<(String, String)> = self
            .sessions
            .iter()
            .filter(|s| !self.is_live(s.value(), now))
            .map(|s| (s.key().clone(), s.username.clone()))
            .collect();
        for (id, username) in &expired {
            self.remove(id, username);
        }
        expired.len()
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.len()
    }
}
