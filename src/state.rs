use std::sync::Arc;

use tracing::info;

use crate::{
    auth::{
        password::PasswordHasher,
        rate_limit::RateLimiter,
        repo::{CredentialStore, MemoryCredentialStore},
        session::SessionRegistry,
    },
    config::{AppConfig, StoreBackend},
    db::PgCredentialStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub store: Arc<dyn CredentialStore>,
    pub hasher: PasswordHasher,
    pub limiter: Arc<RateLimiter>,
    pub sessions: Arc<SessionRegistry>,
}

impl AppState {
    pub async fn init() -> anyhow::Result<Self> {
        let config = AppConfig::from_env()?;

        let store = match config.store_backend {
            StoreBackend::Postgres => {
                let url = config
                    .database_url
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is not set"))?;
                Arc::new(PgCredentialStore::connect(url).await?) as Arc<dyn CredentialStore>
            }
            StoreBackend::Memory => {
                info!("using in-memory credential store; accounts vanish on restart");
                Arc::new(MemoryCredentialStore::new()) as Arc<dyn CredentialStore>
            }
        };

        Self::from_parts(config, store)
    }

    pub fn from_parts(config: AppConfig, store: Arc<dyn CredentialStore>) -> anyhow::Result<Self> {
        let hasher = PasswordHasher::new(&config.hasher)?;
        let limiter = Arc::new(RateLimiter::new(&config.rate_limit));
        let sessions = Arc::new(SessionRegistry::new(&config.session));
        Ok(Self {
            config: Arc::new(config),
            store,
            hasher,
            limiter,
            sessions,
        })
    }

    #[cfg(test)]
    pub fn fake() -> Self {
        Self::fake_with(AppConfig::for_tests())
    }

    #[cfg(test)]
    pub fn fake_with(config: AppConfig) -> Self {
        let store = Arc::new(MemoryCredentialStore::new()) as Arc<dyn CredentialStore>;
        Self::from_parts(config, store).expect("test state")
    }
}
