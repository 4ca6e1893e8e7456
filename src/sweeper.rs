use std::{sync::Arc, time::Duration};

use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::auth::{rate_limit::RateLimiter, session::SessionRegistry};

/// Background task that evicts stale rate-limit windows and idle sessions.
pub struct Sweeper {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    pub fn spawn(limiter: Arc<RateLimiter>, sessions: Arc<SessionRegistry>, every: Duration) -> Self {
        let (stop, mut stopped) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let windows = limiter.sweep();
                        let expired = sessions.sweep();
                        if windows > 0 || expired > 0 {
                            debug!(windows, sessions = expired, "swept stale entries");
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
            info!("sweeper stopped");
        });
        Self { stop, handle }
    }

    pub async fn shutdown(self) {
        let _ = self.stop.send(true);
        if let Err(e) = self.handle.await {
            warn!(error = %e, "sweeper task ended abnormally");
        }
    }
}
