use std::sync::Arc;
use std::time::Instant;

use crate::config::AppConfig;
use crate::ratelimit::RateLimiter;
use crate::registry::VaultRegistry;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub registry: Arc<VaultRegistry>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AppConfig) -> Self {
        let registry = Arc::new(VaultRegistry::new(config.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.search_rate_per_min,
            config.reindex_rate_per_min,
        ));
        Self {
            config,
            registry,
            rate_limiter,
            started_at: Instant::now(),
        }
    }
}
