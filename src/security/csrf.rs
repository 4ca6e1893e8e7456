//! Double-submit CSRF protection.
//!
//! A script-readable `XSRF-TOKEN` cookie is handed out to any client that lacks
//! one; state-changing requests must echo it back in the `X-XSRF-TOKEN` header
//! or a `_csrf` form field.

use axum::{
    body::{to_bytes, Body},
    extract::{FromRequest, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Form,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use serde::Deserialize;
use tracing::warn;

use crate::{auth::session::random_token, error::AppError, state::AppState};

pub const CSRF_COOKIE: &str = "XSRF-TOKEN";
pub const CSRF_HEADER: &str = "x-xsrf-token";
const CSRF_TOKEN_LEN: usize = 32;
const FORM_BODY_LIMIT: usize = 16 * 1024;

/// JSON API endpoints that take no ambient credentials.
const EXEMPT_PATHS: &[&str] = &["/api/register"];

#[derive(Deserialize)]
struct CsrfField {
    #[serde(rename = "_csrf")]
    csrf: Option<String>,
}

fn requires_token(method: &Method, path: &str) -> bool {
    let state_changing = matches!(
        *method,
        Method::POST | Method::PUT | Method::PATCH | Method::DELETE
    );
    state_changing && !EXEMPT_PATHS.contains(&path)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn is_form(req: &Request) -> bool {
    req.headers()
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

/// Pull the submitted token out of the header or, for forms, the body. The body
/// is buffered and put back so the handler can still read it.
async fn submitted_token(req: Request) -> Result<(Option<String>, Request), Response> {
    if let Some(token) = req
        .headers()
        .get(CSRF_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
    {
        return Ok((Some(token), req));
    }
    if !is_form(&req) {
        return Ok((None, req));
    }

    let (parts, body) = req.into_parts();
    let bytes = to_bytes(body, FORM_BODY_LIMIT)
        .await
        .map_err(|_| StatusCode::PAYLOAD_TOO_LARGE.into_response())?;

    let mut probe = Request::new(Body::from(bytes.clone()));
    *probe.method_mut() = Method::POST;
    probe.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/x-www-form-urlencoded"),
    );
    let token = Form::<CsrfField>::from_request(probe, &())
        .await
        .ok()
        .and_then(|Form(field)| field.csrf);

    Ok((token, Request::from_parts(parts, Body::from(bytes))))
}

pub async fn protect(
    State(state): State<AppState>,
    jar: CookieJar,
    req: Request,
    next: Next,
) -> Response {
    if !state.config.security.csrf_enabled {
        return next.run(req).await;
    }

    let expected = jar.get(CSRF_COOKIE).map(|c| c.value().to_owned());

    let req = if requires_token(req.method(), req.uri().path()) {
        let path = req.uri().path().to_owned();
        let (submitted, req) = match submitted_token(req).await {
            Ok(found) => found,
            Err(response) => return response,
        };
        match (&expected, &submitted) {
            (Some(e), Some(s)) if constant_time_eq(e.as_bytes(), s.as_bytes()) => req,
            _ => {
                warn!(%path, has_cookie = expected.is_some(), "csrf token missing or mismatched");
                return AppError::Csrf.into_response();
            }
        }
    } else {
        req
    };

    let response = next.run(req).await;
    if expected.is_some() {
        return response;
    }

    let cookie = Cookie::build((CSRF_COOKIE, random_token(CSRF_TOKEN_LEN)))
        .path("/")
        .http_only(false)
        .secure(state.config.security.require_https)
        .same_site(SameSite::Lax)
        .build();
    (jar.add(cookie), response).into_response()
}
