use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

/// Authorization role carried by a user and their sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Admin,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Admin => "admin",
        }
    }
}

impl FromStr for Role {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user" => Ok(Role::User),
            "admin" => Ok(Role::Admin),
            other => anyhow::bail!("unknown role: {other}"),
        }
    }
}

/// User record in the credential store.
#[derive(Clone)]
pub struct User {
    pub id: Uuid,                              // unique user ID
    pub username: String,                      // case-sensitive login name
    pub password_hash: String,                 // Argon2 PHC string, never logged
    pub role: Role,
    pub failed_login_attempts: i32,
    pub account_non_locked: bool,
    pub last_login_at: Option<OffsetDateTime>,
    pub created_at: OffsetDateTime,
}

impl fmt::Debug for User {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("User")
            .field("id", &self.id)
            .field("username", &self.username)
            .field("password_hash", &"<redacted>")
            .field("role", &self.role)
            .field("failed_login_attempts", &self.failed_login_attempts)
            .field("account_non_locked", &self.account_non_locked)
            .field("last_login_at", &self.last_login_at)
            .field("created_at", &self.created_at)
            .finish()
    }
}

/// Insert payload: a validated username plus an already-hashed password.
pub struct NewUser {
    pub username: String,
    pub password_hash: String,
    pub role: Role,
}
