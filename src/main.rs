use std::net::SocketAddr;

mod app;
mod auth;
mod config;
mod db;
mod error;
mod routes;
mod security;
mod state;
mod sweeper;

use crate::{state::AppState, sweeper::Sweeper};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let env_filter = std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "authgate=debug,axum=info,tower_http=info".to_string());
    let json_logs = std::env::var("LOG_FORMAT")
        .map(|v| v == "json")
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
    }

    let app_state = AppState::init().await?;
    let addr: SocketAddr = format!("{}:{}", app_state.config.host, app_state.config.port).parse()?;

    let sweeper = Sweeper::spawn(
        app_state.limiter.clone(),
        app_state.sessions.clone(),
        app_state.limiter.window(),
    );

    let result = app::serve(app::build_app(app_state), addr).await;
    sweeper.shutdown().await;
    result
}
