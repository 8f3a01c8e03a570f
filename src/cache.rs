use serde::{de::DeserializeOwned, Serialize};
use serde_json::Value;
use std::{future::Future, sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::CacheConfig,
    error::{GovernorError, Result},
    metrics::Metrics,
    store::{BackendStatus, CounterStore, FallbackStore, Layer},
};

/// JSON response cache with TTL.
///
/// The cache is advisory: a miss (or any backend trouble) only means
/// "recompute". Absent results are never cached.
pub struct CacheService {
    store: FallbackStore,
    config: CacheConfig,
    metrics: Arc<Metrics>,
}

impl CacheService {
    pub fn new(store: FallbackStore, config: CacheConfig, metrics: Arc<Metrics>) -> Self {
        Self {
            store,
            config,
            metrics,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Configured TTL for a result category such as `chat` or `search`
    pub fn ttl_for(&self, category: &str) -> Duration {
        self.config.ttl_for(category)
    }

    pub async fn get(&self, key: &str) -> Option<Value> {
        self.get_json(key).await
    }

    pub async fn set(&self, key: &str, value: &Value, ttl: Duration) -> Result<()> {
        self.set_json(key, value, ttl).await
    }

    /// Look up and deserialize a cached value.
    ///
    /// Store failures and payloads that no longer deserialize are misses.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        if !self.config.enabled {
            return None;
        }

        let (payload, layer) = match self.store.lookup(key).await {
            Ok((Some(payload), layer)) => (payload, layer),
            Ok((None, layer)) => {
                self.metrics.record_cache_miss(layer.as_str());
                return None;
            }
            Err(e) => {
                warn!(key, error = %e, "cache lookup failed");
                self.metrics.record_cache_miss(Layer::Local.as_str());
                return None;
            }
        };

        match serde_json::from_str(&payload) {
            Ok(value) => {
                debug!(key, layer = layer.as_str(), "cache hit");
                self.metrics.record_cache_hit(layer.as_str());
                Some(value)
            }
            Err(e) => {
                warn!(key, error = %e, "discarding undecodable cache entry");
                self.metrics.record_cache_miss(layer.as_str());
                None
            }
        }
    }

    /// Serialize and store a value for `ttl`
    pub async fn set_json<T: Serialize + ?Sized>(&self, key: &str, value: &T, ttl: Duration) -> Result<()> {
        if !self.config.enabled {
            return Ok(());
        }
        if ttl.is_zero() {
            return Err(GovernorError::Config(format!(
                "cache ttl for {} must be positive",
                key
            )));
        }

        let payload = serde_json::to_string(value)?;
        self.store.set(key, &payload, ttl).await
    }

    /// Return the cached value for `key`, or run `compute` and cache its result.
    ///
    /// Errors from `compute` are returned as-is and nothing is cached.
    pub async fn memoize<T, E, F, Fut>(&self, key: &str, ttl: Duration, compute: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get_json::<T>(key).await {
            return Ok(cached);
        }

        let value = compute().await?;
        if let Err(e) = self.set_json(key, &value, ttl).await {
            warn!(key, error = %e, "failed to cache computed value");
        }
        Ok(value)
    }

    /// Empty the local map and drop the remote connection (test/admin reset)
    pub async fn clear(&self) {
        if let Err(e) = self.store.reset().await {
            warn!(error = %e, "cache reset failed");
        }
    }

    pub async fn backend_status(&self) -> BackendStatus {
        self.store.remote_status().await
    }
}
