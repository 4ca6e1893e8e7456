use std::{str::FromStr, time::Duration};

use anyhow::Context;

/// Where user records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreBackend {
    Postgres,
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "postgres" | "pg" => Ok(Self::Postgres),
            "memory" | "mem" => Ok(Self::Memory),
            other => anyhow::bail!("unknown store backend: {other}"),
        }
    }
}

/// What happens when a user who already holds a live session logs in again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPolicy {
    EvictOldest,
    RejectNew,
}

impl FromStr for SessionPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "evict_oldest" | "evict" => Ok(Self::EvictOldest),
            "reject_new" | "reject" => Ok(Self::RejectNew),
            other => anyhow::bail!("unknown session policy: {other}"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
}

/// Argon2id work factor.
#[derive(Debug, Clone)]
pub struct HasherConfig {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub policy: SessionPolicy,
    pub idle_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct SecurityConfig {
    pub trust_proxy_headers: bool,
    pub require_https: bool,
    pub csrf_enabled: bool,
    pub lockout_threshold: u32,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub store_backend: StoreBackend,
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub rate_limit: RateLimitConfig,
    pub hasher: HasherConfig,
    pub session: SessionConfig,
    pub security: SecurityConfig,
}

fn env_or<T>(key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("invalid value for {key}: {e}")),
        _ => Ok(default),
    }
}

fn minutes(key: &str, value: u64) -> anyhow::Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| anyhow::anyhow!("{key} is too large"))
}

impl AppConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        let store_backend = env_or("STORE_BACKEND", StoreBackend::Postgres)?;
        let database_url = std::env::var("DATABASE_URL").ok();
        if store_backend == StoreBackend::Postgres && database_url.is_none() {
            anyhow::bail!("DATABASE_URL must be set when STORE_BACKEND=postgres");
        }

        let window_secs: u64 = env_or("RATE_LIMIT_WINDOW_SECS", 60)?;
        let idle_minutes: u64 = env_or("SESSION_IDLE_MINUTES", 30)?;

        let config = Self {
            store_backend,
            database_url,
            host: std::env::var("APP_HOST").unwrap_or_else(|_| "0.0.0.0".into()),
            port: env_or("APP_PORT", 8080)?,
            rate_limit: RateLimitConfig {
                max_requests: env_or("RATE_LIMIT_MAX_REQUESTS", 10)?,
                window: Duration::from_secs(window_secs),
            },
            hasher: HasherConfig {
                memory_kib: env_or("HASH_MEMORY_KIB", 19 * 1024)?,
                iterations: env_or("HASH_ITERATIONS", 2)?,
                parallelism: env_or("HASH_PARALLELISM", 1)?,
            },
            session: SessionConfig {
                policy: env_or("SESSION_POLICY", SessionPolicy::EvictOldest)?,
                idle_timeout: minutes("SESSION_IDLE_MINUTES", idle_minutes)?,
            },
            security: SecurityConfig {
                trust_proxy_headers: env_or("TRUST_PROXY_HEADERS", false)?,
                require_https: env_or("REQUIRE_HTTPS", true)?,
                csrf_enabled: env_or("CSRF_ENABLED", true)?,
                lockout_threshold: env_or("LOCKOUT_THRESHOLD", 5)?,
            },
        };
        config.validate().context("validate configuration")?;
        Ok(config)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.rate_limit.window.is_zero() {
            anyhow::bail!("RATE_LIMIT_WINDOW_SECS must be positive");
        }
        if self.rate_limit.max_requests == 0 {
            anyhow::bail!("RATE_LIMIT_MAX_REQUESTS must be positive");
        }
        if self.session.idle_timeout.is_zero() {
            anyhow::bail!("SESSION_IDLE_MINUTES must be positive");
        }
        if self.security.lockout_threshold == 0 {
            anyhow::bail!("LOCKOUT_THRESHOLD must be positive");
        }
        Ok(())
    }

    /// Cheap, permissive settings for unit tests: in-memory store, fast hashing,
    /// proxy headers trusted so tests can pick client addresses.
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            store_backend: StoreBackend::Memory,
            database_url: None,
            host: "127.0.0.1".into(),
            port: 0,
            rate_limit: RateLimitConfig {
                max_requests: 10,
                window: Duration::from_secs(60),
            },
            hasher: HasherConfig {
                memory_kib: 1024,
                iterations: 1,
                parallelism: 1,
            },
            session: SessionConfig {
                policy: SessionPolicy::EvictOldest,
                idle_timeout: Duration::from_secs(30 * 60),
            },
            security: SecurityConfig {
                trust_proxy_headers: true,
                require_https: false,
                csrf_enabled: false,
                lockout_threshold: 5,
            },
        }
    }
}
