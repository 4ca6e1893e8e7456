use axum::{
    extract::{Request, State},
    http::{header, HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde_json::json;
use tracing::debug;

use crate::{auth::rate_limit::peer_addr, state::AppState};

/// Whether the request reached the proxy over TLS. Only meaningful behind a
/// trusted proxy; without one the header is client-controlled.
fn forwarded_https(headers: &HeaderMap, trust_proxy: bool) -> bool {
    trust_proxy
        && headers
            .get("x-forwarded-proto")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

fn https_location(host: &str, req: &Request) -> String {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    format!("https://{host}{path_and_query}")
}

/// Sends plain-HTTP callers to the HTTPS origin. Loopback peers are let
/// through so health checks and local tooling keep working.
pub async fn require_https(State(state): State<AppState>, req: Request, next: Next) -> Response {
    let security = &state.config.security;
    if !security.require_https || forwarded_https(req.headers(), security.trust_proxy_headers) {
        return next.run(req).await;
    }
    if peer_addr(&req).is_some_and(|addr| addr.ip().is_loopback()) {
        return next.run(req).await;
    }

    let host = req
        .headers()
        .get(header::HOST)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned);
    match host {
        Some(host) => {
            let location = https_location(&host, &req);
            debug!(%location, "redirecting insecure request");
            Redirect::permanent(&location).into_response()
        }
        None => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "HTTPS is required" })),
        )
            .into_response(),
    }
}
