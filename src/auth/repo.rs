use async_trait::async_trait;
use dashmap::{mapref::entry::Entry, DashMap};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::auth::repo_types::{NewUser, User};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("username already exists")]
    Duplicate,
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

/// Persistence for user records. Every mutation targets one row, identified by username.
#[async_trait]
pub trait CredentialStore: Send + Sync + 'static {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError>;

    async fn exists_by_username(&self, username: &str) -> Result<bool, StoreError>;

    /// Insert a new user. A username collision yields [`StoreError::Duplicate`].
    async fn save(&self, user: NewUser) -> Result<User, StoreError>;

    async fn update_failed_login_attempts(
        &self,
        username: &str,
        attempts: i32,
    ) -> Result<(), StoreError>;

    /// Add one to the failure counter and return the new value, as a single
    /// atomic step per username. Unknown usernames yield 0.
    async fn increment_failed_login_attempts(&self, username: &str) -> Result<i32, StoreError>;

    /// Record a successful login and zero the failure counter in the same write.
    async fn update_last_login_time(
        &self,
        username: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError>;

    /// Idempotent.
    async fn lock_account(&self, username: &str) -> Result<(), StoreError>;
}

/// Process-local store. Each user lives in its own map entry, so writes for one
/// username serialize on that entry while other usernames proceed in parallel.
#[derive(Default)]
pub struct MemoryCredentialStore {
    users: DashMap<String, User>,
}

impl MemoryCredentialStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CredentialStore for MemoryCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(username).map(|u| u.value().clone()))
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool, StoreError> {
        Ok(self.users.contains_key(username))
    }

    async fn save(&self, user: NewUser) -> Result<User, StoreError> {
        match self.users.entry(user.username.clone()) {
            Entry::Occupied(_) => Err(StoreError::Duplicate),
            Entry::Vacant(slot) => {
                let record = User {
                    id: Uuid::new_v4(),
                    username: user.username,
                    password_hash: user.password_hash,
                    role: user.role,
                    failed_login_attempts: 0,
                    account_non_locked: true,
                    last_login_at: None,
                    created_at: OffsetDateTime::now_utc(),
                };
                slot.insert(record.clone());
                Ok(record)
            }
        }
    }

    async fn update_failed_login_attempts(
        &self,
        username: &str,
        attempts: i32,
    ) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(username) {
            user.failed_login_attempts = attempts.max(0);
        }
        Ok(())
    }

    async fn increment_failed_login_attempts(&self, username: &str) -> Result<i32, StoreError> {
        Ok(match self.users.get_mut(username) {
            Some(mut user) => {
                user.failed_login_attempts = user.failed_login_attempts.saturating_add(1);
                user.failed_login_attempts
            }
            None => 0,
        })
    }

    async fn update_last_login_time(
        &self,
        username: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(username) {
            user.last_login_at = Some(at);
            user.failed_login_attempts = 0;
        }
        Ok(())
    }

    async fn lock_account(&self, username: &str) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(username) {
            user.account_non_locked = false;
        }
        Ok(())
    }
}
