//! Page endpoints. They answer with small JSON documents describing what the
//! page would show; rendering is left to whatever front end sits on top.

use axum::{
    extract::{Query, State},
    response::Redirect,
    Json,
};
use serde::Serialize;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tracing::instrument;

use crate::{
    auth::{
        dto::LoginPageQuery,
        extractors::{AdminUser, CurrentUser, LOGIN_PAGE},
        repo_types::Role,
    },
    error::INVALID_CREDENTIALS_MESSAGE,
    state::AppState,
};

pub const LOGOUT_MESSAGE: &str = "You have been logged out successfully";

#[derive(Debug, Serialize)]
pub struct DashboardResponse {
    pub username: String,
    #[serde(with = "time::serde::rfc3339")]
    pub signed_in_at: OffsetDateTime,
}

#[derive(Debug, Serialize)]
pub struct AdminResponse {
    pub username: String,
    pub role: Role,
    pub active_sessions: usize,
}

pub async fn index() -> Redirect {
    Redirect::to(LOGIN_PAGE)
}

pub async fn login_page(Query(query): Query<LoginPageQuery>) -> Json<Value> {
    if query.error.is_some() {
        Json(json!({ "error": INVALID_CREDENTIALS_MESSAGE }))
    } else if query.logout.is_some() {
        Json(json!({ "message": LOGOUT_MESSAGE }))
    } else {
        Json(json!({}))
    }
}

pub async fn register_page() -> Json<Value> {
    Json(json!({ "fields": ["username", "password"] }))
}

#[instrument(skip(session), fields(user_id = %session.user_id))]
pub async fn dashboard(CurrentUser(session): CurrentUser) -> Json<DashboardResponse> {
    Json(DashboardResponse {
        username: session.username,
        signed_in_at: session.created_at,
    })
}

#[instrument(skip(state, session), fields(user_id = %session.user_id))]
pub async fn admin(
    State(state): State<AppState>,
    AdminUser(session): AdminUser,
) -> Json<AdminResponse> {
    Json(AdminResponse {
        username: session.username,
        role: session.role,
        active_sessions: state.sessions.active_sessions(),
    })
}
