use time::OffsetDateTime;
use tracing::{info, instrument, warn};

use crate::{
    auth::{
        dto::RegisterRequest,
        repo_types::{NewUser, Role, User},
        session::{Session, SessionError},
        validation,
    },
    error::{AppError, AuthFailure},
    state::AppState,
};

/// Validate, hash and persist a new account. Nothing is written unless every
/// validation step passes.
#[instrument(skip(state, request), fields(username = %request.username.trim()))]
pub async fn register_user(state: &AppState, request: RegisterRequest) -> Result<User, AppError> {
    let input =
        validation::validate(state.store.as_ref(), &request.username, &request.password).await?;

    let password_hash = state.hasher.hash_blocking(input.password).await?;
    let user = state
        .store
        .save(NewUser {
            username: input.username,
            password_hash,
            role: Role::User,
        })
        .await?;

    info!(user_id = %user.id, username = %user.username, "user registered");
    Ok(user)
}

/// Check a username/password pair and maintain the failure counter and lockout.
///
/// Every refusal comes back as [`AppError::Authentication`]; the variant inside
/// says why, for logs only.
#[instrument(skip(state, password))]
pub async fn authenticate(state: &AppState, username: &str, password: &str) -> Result<User, AppError> {
    let user = match state.store.find_by_username(username).await? {
        Some(user) => user,
        None => {
            state.hasher.verify_dummy_blocking(password.to_owned()).await?;
            warn!(cause = %AuthFailure::UnknownUser, "login refused");
            return Err(AppError::Authentication(AuthFailure::UnknownUser));
        }
    };

    if !user.account_non_locked {
        // same Argon2 cost as the other refusals
        state.hasher.verify_dummy_blocking(password.to_owned()).await?;
        warn!(user_id = %user.id, cause = %AuthFailure::AccountLocked, "login refused");
        return Err(AppError::Authentication(AuthFailure::AccountLocked));
    }

    let matches = state
        .hasher
        .verify_blocking(password.to_owned(), user.password_hash.clone())
        .await?;

    if !matches {
        let attempts = state
            .store
            .increment_failed_login_attempts(&user.username)
            .await?;

        let threshold = i32::try_from(state.config.security.lockout_threshold).unwrap_or(i32::MAX);
        if attempts >= threshold {
            state.store.lock_account(&user.username).await?;
            warn!(user_id = %user.id, attempts, "account locked after repeated failures");
        }
        warn!(user_id = %user.id, attempts, cause = %AuthFailure::BadPassword, "login refused");
        return Err(AppError::Authentication(AuthFailure::BadPassword));
    }

    let now = OffsetDateTime::now_utc();
    state.store.update_last_login_time(&user.username, now).await?;
    info!(user_id = %user.id, "credentials accepted");

    Ok(User {
        failed_login_attempts: 0,
        last_login_at: Some(now),
        ..user
    })
}

/// Full login: credentials, then a session under the single-session policy.
pub async fn login(state: &AppState, username: &str, password: &str) -> Result<Session, AppError> {
    let user = authenticate(state, username, password).await?;
    state.sessions.issue(&user).map_err(|e| match e {
        SessionError::LimitReached => {
            warn!(user_id = %user.id, cause = %AuthFailure::SessionLimitReached, "login refused");
            AppError::Authentication(AuthFailure::SessionLimitReached)
        }
    })
}
