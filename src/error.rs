//! Central error type and its HTTP rendering.
use std::{fmt, time::Duration};

use axum::{
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;
use tracing::error;

use crate::auth::{repo::StoreError, validation::USERNAME_TAKEN};

pub const RATE_LIMIT_MESSAGE: &str = "Too many login attempts. Please try again later.";
pub const INVALID_CREDENTIALS_MESSAGE: &str = "Invalid username or password";

/// Why a login was refused. Only ever logged; clients see one generic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFailure {
    UnknownUser,
    BadPassword,
    AccountLocked,
    SessionLimitReached,
}

impl fmt::Display for AuthFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cause = match self {
            AuthFailure::UnknownUser => "unknown username",
            AuthFailure::BadPassword => "bad password",
            AuthFailure::AccountLocked => "account locked",
            AuthFailure::SessionLimitReached => "session limit reached",
        };
        f.write_str(cause)
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("{0}")]
    Validation(String),

    #[error("authentication failed: {0}")]
    Authentication(AuthFailure),

    #[error("rate limit exceeded")]
    RateLimitExceeded { retry_after: Duration },

    #[error("access denied")]
    Forbidden,

    #[error("invalid CSRF token")]
    Csrf,

    #[error("storage error: {0:#}")]
    Storage(#[from] anyhow::Error),
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate => AppError::Validation(USERNAME_TAKEN.into()),
            StoreError::Backend(e) => AppError::Storage(e),
        }
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Authentication(_) => StatusCode::UNAUTHORIZED,
            AppError::RateLimitExceeded { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::Forbidden | AppError::Csrf => StatusCode::FORBIDDEN,
            AppError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text that is safe to show a client.
    pub fn public_message(&self) -> String {
        match self {
            AppError::Validation(reason) => reason.clone(),
            AppError::Authentication(_) => INVALID_CREDENTIALS_MESSAGE.to_string(),
            AppError::RateLimitExceeded { .. } => RATE_LIMIT_MESSAGE.to_string(),
            AppError::Forbidden => "Access denied".to_string(),
            AppError::Csrf => "Invalid CSRF token".to_string(),
            AppError::Storage(_) => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if let AppError::Storage(e) = &self {
            error!(error = ?e, "request failed on an internal error");
        }

        let status = self.status_code();
        let body = Json(json!({ "error": self.public_message() }));
        let mut response = (status, body).into_response();

        if let AppError::RateLimitExceeded { retry_after } = self {
            // whole seconds, rounded up
            let secs = retry_after.as_secs() + u64::from(retry_after.subsec_nanos() > 0);
            if let Ok(value) = HeaderValue::from_str(&secs.max(1).to_string()) {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }
        response
    }
}
