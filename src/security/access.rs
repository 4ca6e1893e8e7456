use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
};
use axum_extra::extract::cookie::CookieJar;
use tracing::{debug, warn};

use crate::{
    auth::{extractors::LOGIN_PAGE, repo_types::Role, session::SESSION_COOKIE},
    error::AppError,
    state::AppState,
};

/// What a path demands of the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Public,
    Authenticated,
    Admin,
}

const PUBLIC_PATHS: &[&str] = &[
    "/",
    "/login",
    "/register",
    "/logout",
    "/health",
    "/api/register",
    "/api/login",
];

const PUBLIC_PREFIXES: &[&str] = &["/css/", "/js/", "/images/"];

fn under(path: &str, prefix: &str) -> bool {
    path == prefix
        || path
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('/'))
}

pub fn classify(path: &str) -> Access {
    if PUBLIC_PATHS.contains(&path) || PUBLIC_PREFIXES.iter().any(|p| path.starts_with(p)) {
        Access::Public
    } else if under(path, "/admin") {
        Access::Admin
    } else {
        Access::Authenticated
    }
}

/// Resolves the session cookie, applies the path's access rule and attaches the
/// session to the request for handlers to extract.
pub async fn gate(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Response {
    let session = jar
        .get(SESSION_COOKIE)
        .and_then(|c| state.sessions.resolve(c.value()));
    let path = req.uri().path().to_owned();

    match (classify(&path), &session) {
        (Access::Public, _) => {}
        (Access::Authenticated | Access::Admin, None) => {
            debug!(%path, "unauthenticated request to protected path");
            return Redirect::to(LOGIN_PAGE).into_response();
        }
        (Access::Admin, Some(s)) if s.role != Role::Admin => {
            warn!(%path, user_id = %s.user_id, "non-admin request to admin path");
            return AppError::Forbidden.into_response();
        }
        _ => {}
    }

    if let Some(session) = session {
        req.extensions_mut().insert(session);
    }
    next.run(req).await
}
