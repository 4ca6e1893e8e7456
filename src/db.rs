use anyhow::Context;
use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, FromRow, PgPool};
use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::{
    repo::{CredentialStore, StoreError},
    repo_types::{NewUser, Role, User},
};

/// Postgres-backed store. Row-level consistency for concurrent updates to one
/// user comes from the database; every value is bound as a parameter.
#[derive(Clone)]
pub struct PgCredentialStore {
    db: PgPool,
}

#[derive(FromRow)]
struct UserRow {
    id: Uuid,
    username: String,
    password_hash: String,
    role: String,
    failed_login_attempts: i32,
    account_non_locked: bool,
    last_login_at: Option<OffsetDateTime>,
    created_at: OffsetDateTime,
}

impl From<UserRow> for User {
    fn from(row: UserRow) -> Self {
        let role = row.role.parse().unwrap_or_else(|_| {
            warn!(user_id = %row.id, role = %row.role, "unknown role in users table; treating as user");
            Role::User
        });
        User {
            id: row.id,
            username: row.username,
            password_hash: row.password_hash,
            role,
            failed_login_attempts: row.failed_login_attempts,
            account_non_locked: row.account_non_locked,
            last_login_at: row.last_login_at,
            created_at: row.created_at,
        }
    }
}

fn storage_error(err: sqlx::Error, action: &'static str) -> StoreError {
    if let sqlx::Error::Database(db_err) = &err {
        if db_err.is_unique_violation() {
            return StoreError::Duplicate;
        }
    }
    StoreError::Backend(anyhow::Error::new(err).context(action))
}

impl PgCredentialStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let db = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .context("connect to database")?;

        // Run migrations if present
        if let Err(e) = sqlx::migrate!("./migrations").run(&db).await {
            warn!(error = %e, "migration failed; continuing with existing schema");
        } else {
            info!("database migrations applied");
        }
        Ok(Self::new(db))
    }
}

#[async_trait]
impl CredentialStore for PgCredentialStore {
    async fn find_by_username(&self, username: &str) -> Result<Option<User>, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            SELECT id, username, password_hash, role, failed_login_attempts,
                   account_non_locked, last_login_at, created_at
            FROM users
            WHERE username = $1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| storage_error(e, "find user by username"))?;
        Ok(row.map(User::from))
    }

    async fn exists_by_username(&self, username: &str) -> Result<bool, StoreError> {
        let exists: bool =
            sqlx::query_scalar(r#"SELECT EXISTS(SELECT 1 FROM users WHERE username = $1)"#)
                .bind(username)
                .fetch_one(&self.db)
                .await
                .map_err(|e| storage_error(e, "check username exists"))?;
        Ok(exists)
    }

    async fn save(&self, user: NewUser) -> Result<User, StoreError> {
        let row = sqlx::query_as::<_, UserRow>(
            r#"
            INSERT INTO users (username, password_hash, role)
            VALUES ($1, $2, $3)
            RETURNING id, username, password_hash, role, failed_login_attempts,
                      account_non_locked, last_login_at, created_at
            "#,
        )
        .bind(&user.username)
        .bind(&user.password_hash)
        .bind(user.role.as_str())
        .fetch_one(&self.db)
        .await
        .map_err(|e| storage_error(e, "insert user"))?;
        Ok(row.into())
    }

    async fn update_failed_login_attempts(
        &self,
        username: &str,
        attempts: i32,
    ) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE users SET failed_login_attempts = $2 WHERE username = $1"#)
            .bind(username)
            .bind(attempts.max(0))
            .execute(&self.db)
            .await
            .map_err(|e| storage_error(e, "update failed login attempts"))?;
        Ok(())
    }

    async fn increment_failed_login_attempts(&self, username: &str) -> Result<i32, StoreError> {
        let attempts: Option<i32> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET failed_login_attempts = failed_login_attempts + 1
            WHERE username = $1
            RETURNING failed_login_attempts
            "#,
        )
        .bind(username)
        .fetch_optional(&self.db)
        .await
        .map_err(|e| storage_error(e, "increment failed login attempts"))?;
        Ok(attempts.unwrap_or(0))
    }

    async fn update_last_login_time(
        &self,
        username: &str,
        at: OffsetDateTime,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE users
            SET last_login_at = $2, failed_login_attempts = 0
            WHERE username = $1
            "#,
        )
        .bind(username)
        .bind(at)
        .execute(&self.db)
        .await
        .map_err(|e| storage_error(e, "update last login time"))?;
        Ok(())
    }

    async fn lock_account(&self, username: &str) -> Result<(), StoreError> {
        sqlx::query(r#"UPDATE users SET account_non_locked = FALSE WHERE username = $1"#)
            .bind(username)
            .execute(&self.db)
            .await
            .map_err(|e| storage_error(e, "lock account"))?;
        Ok(())
    }
}
