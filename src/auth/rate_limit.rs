//! Fixed-window admission control for login attempts, keyed by client identifier.

use std::{
    net::SocketAddr,
    time::{Duration, Instant},
};

use axum::{
    extract::{ConnectInfo, Request, State},
    http::HeaderMap,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::{config::RateLimitConfig, error::AppError, state::AppState};

#[derive(Debug)]
struct RequestWindow {
    request_count: u32,
    window_start: Instant,
    last_seen: Instant,
}

impl RequestWindow {
    fn new(now: Instant) -> Self {
        Self {
            request_count: 0,
            window_start: now,
            last_seen: now,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Allowed { remaining: u32 },
    Denied { retry_after: Duration },
}

/// Owned by [`AppState`]; windows are created lazily per client and dropped by
/// [`RateLimiter::sweep`] once idle for a full window.
#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<String, RequestWindow>,
    max_requests: u32,
    window: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests: config.max_requests,
            window: config.window,
        }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn admit(&self, client: &str) -> Admission {
        self.admit_at(client, Instant::now())
    }

    /// Reset-if-expired, check and increment happen while holding the entry's
    /// shard lock, so concurrent requests from one client cannot over-admit.
    pub fn admit_at(&self, client: &str, now: Instant) -> Admission {
        let mut entry = self
            .windows
            .entry(client.to_owned())
            .or_insert_with(|| RequestWindow::new(now));
        entry.last_seen = now;

        let elapsed = now.saturating_duration_since(entry.window_start);
        if elapsed >= self.window {
            entry.request_count = 0;
            entry.window_start = now;
        }

        if entry.request_count < self.max_requests {
            entry.request_count += 1;
            Admission::Allowed {
                remaining: self.max_requests - entry.request_count,
            }
        } else {
            let elapsed = now.saturating_duration_since(entry.window_start);
            Admission::Denied {
                retry_after: self.window.saturating_sub(elapsed),
            }
        }
    }

    /// Drop windows idle for at least one window length. Returns how many went.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.last_seen) < self.window);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Who is asking. Proxy headers are only honoured when the deployment says a
/// trusted proxy sits in front; otherwise a client could pick its own key.
pub fn client_identifier(headers: &HeaderMap, peer: Option<SocketAddr>, trust_proxy: bool) -> String {
    if trust_proxy {
        let forwarded = headers
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = forwarded {
            return ip.to_owned();
        }

        let real_ip = headers
            .get("x-real-ip")
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty());
        if let Some(ip) = real_ip {
            return ip.to_owned();
        }
    }

    peer.map(|addr| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr)
}

/// Route layer for the login endpoint: denied requests never reach credential checks.
pub async fn limit_login_attempts(
    State(state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    let client = client_identifier(
        req.headers(),
        peer_addr(&req),
        state.config.security.trust_proxy_headers,
    );

    match state.limiter.admit(&client) {
        Admission::Allowed { remaining } => {
            debug!(%client, remaining, "login attempt admitted");
            next.run(req).await
        }
        Admission::Denied { retry_after } => {
            warn!(%client, "rate limit exceeded");
            AppError::RateLimitExceeded { retry_after }.into_response()
        }
    }
}
