use std::{sync::Arc, time::Duration};
use tracing::info;

use crate::{
    cache::CacheService,
    config::GovernorConfig,
    error::Result,
    limiter::RateLimiter,
    memory::MemoryStore,
    metrics::Metrics,
    redis::RedisStore,
    store::{BackendStatus, CounterStore, FallbackStore},
    usage::UsageLimiter,
    utils::TimeSource,
};

/// The three governance services, built once per process.
///
/// All services share one remote backend but each keeps its own local
/// fallback map (and therefore its own lock).
pub struct Governor {
    cache: CacheService,
    rate_limiter: RateLimiter,
    usage: UsageLimiter,
    metrics: Arc<Metrics>,
}

impl Governor {
    /// Build from configuration, using Redis when `redis.enabled` is set.
    ///
    /// Fails only on invalid configuration. An unreachable Redis is not an
    /// error: the connection is opened lazily and failures fall back locally.
    pub fn new(config: &GovernorConfig, metrics: Arc<Metrics>) -> Result<Self> {
        config.validate()?;

        let remote: Option<Arc<dyn CounterStore>> = if config.redis.enabled {
            info!(url = %config.redis.url, "Using Redis backend with local fallback");
            Some(Arc::new(RedisStore::new(config.redis.clone())?))
        } else {
            info!("Redis disabled, using local stores only");
            None
        };

        Self::with_remote(config, remote, TimeSource::new(), metrics)
    }

    /// Build around any remote store and clock
    pub fn with_remote(
        config: &GovernorConfig,
        remote: Option<Arc<dyn CounterStore>>,
        time_source: TimeSource,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate()?;
        let command_timeout = config.redis.command_timeout();

        let store = || {
            Self::fallback_store(config, remote.clone(), command_timeout, &time_source, &metrics)
        };

        Ok(Self {
            cache: CacheService::new(store(), config.cache.clone(), metrics.clone()),
            rate_limiter: RateLimiter::new(
                store(),
                config.rate_limit.clone(),
                time_source.clone(),
                metrics.clone(),
            ),
            usage: UsageLimiter::new(
                store(),
                config.usage.clone(),
                time_source.clone(),
                metrics.clone(),
            ),
            metrics,
        })
    }

    fn fallback_store(
        config: &GovernorConfig,
        remote: Option<Arc<dyn CounterStore>>,
        command_timeout: Duration,
        time_source: &TimeSource,
        metrics: &Arc<Metrics>,
    ) -> FallbackStore {
        let local = MemoryStore::from_config(&config.local, time_source.clone());
        FallbackStore::new(remote, local, command_timeout, metrics.clone())
    }

    pub fn cache(&self) -> &CacheService {
        &self.cache
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn usage(&self) -> &UsageLimiter {
        &self.usage
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    pub async fn backend_status(&self) -> BackendStatus {
        self.cache.backend_status().await
    }

    /// Reset every service's local state (test/admin use)
    pub async fn clear(&self) {
        self.cache.clear().await;
        self.rate_limiter.clear().await;
        self.usage.clear().await;
        info!("Governor state cleared");
    }
}
