use axum::{
    async_trait,
    extract::FromRequestParts,
    http::request::Parts,
    response::{IntoResponse, Redirect, Response},
};

use super::{repo_types::Role, session::Session};
use crate::error::AppError;

pub const LOGIN_PAGE: &str = "/login";

/// The session attached by the access gate. Absent session means the caller
/// is sent to the login page.
pub struct CurrentUser(pub Session);

#[async_trait]
impl<S> FromRequestParts<S> for CurrentUser
where
    S: Send + Sync,
{
    type Rejection = Redirect;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Session>()
            .cloned()
            .map(CurrentUser)
            .ok_or_else(|| Redirect::to(LOGIN_PAGE))
    }
}

/// Like [`CurrentUser`] but also requires the admin role.
pub struct AdminUser(pub Session);

#[async_trait]
impl<S> FromRequestParts<S> for AdminUser
where
    S: Send + Sync,
{
    type Rejection = Response;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let CurrentUser(session) = CurrentUser::from_request_parts(parts, state)
            .await
            .map_err(IntoResponse::into_response)?;
        if session.role != Role::Admin {
            return Err(AppError::Forbidden.into_response());
        }
        Ok(AdminUser(session))
    }
}
