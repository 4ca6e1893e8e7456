use lazy_static::lazy_static;
use regex::Regex;

use crate::{auth::repo::CredentialStore, error::AppError};

pub const USERNAME_MIN: usize = 3;
pub const USERNAME_MAX: usize = 50;
pub const PASSWORD_MIN: usize = 8;
pub const USERNAME_TAKEN: &str = "Username already exists";

lazy_static! {
    static ref STRIPPED_CHARS: Regex = Regex::new(r#"['";\\]"#).unwrap();
    static ref SQL_KEYWORDS: Regex =
        Regex::new(r"(?i)(union|select|insert|update|delete|drop|create|alter)").unwrap();
}

/// Registration input that passed every check.
pub struct ValidatedInput {
    pub username: String,
    pub password: String,
}

/// Trim, drop quote/semicolon/backslash characters, then drop SQL keywords.
///
/// This is a single pass and only narrows what a username can look like; every
/// store still binds values as query parameters.
pub fn sanitize_username(raw: &str) -> String {
    let stripped = STRIPPED_CHARS.replace_all(raw.trim(), "");
    SQL_KEYWORDS.replace_all(&stripped, "").into_owned()
}

/// Checks that need no storage round-trip.
pub fn check_shape(username: &str, password: &str) -> Result<(), AppError> {
    let len = username.chars().count();
    if !(USERNAME_MIN..=USERNAME_MAX).contains(&len) {
        return Err(AppError::Validation(format!(
            "Username must be between {USERNAME_MIN} and {USERNAME_MAX} characters"
        )));
    }
    if password.chars().count() < PASSWORD_MIN {
        return Err(AppError::Validation(format!(
            "Password must be at least {PASSWORD_MIN} characters long"
        )));
    }
    Ok(())
}

pub async fn validate(
    store: &dyn CredentialStore,
    raw_username: &str,
    password: &str,
) -> Result<ValidatedInput, AppError> {
    let username = sanitize_username(raw_username);
    check_shape(&username, password)?;

    if store.exists_by_username(&username).await? {
        return Err(AppError::Validation(USERNAME_TAKEN.into()));
    }

    Ok(ValidatedInput {
        username,
        password: password.to_owned(),
    })
}
