use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::{EndpointLimit, RateLimitConfig},
    error::{GovernorError, QuotaExceeded, Result},
    metrics::Metrics,
    store::{CounterStore, Expiration, FallbackStore},
    utils::{generate_window_key, TimeSource},
};

const KEY_PREFIX: &str = "ratelimit";

/// Outcome of one counted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u64,
    pub remaining: u64,
    /// Window length; a rejected client may retry after this long.
    pub retry_after: Duration,
}

impl RateLimitDecision {
    /// Turn a rejection into `QuotaExceeded`
    pub fn into_result(self) -> Result<Self> {
        if self.allowed {
            Ok(self)
        } else {
            Err(QuotaExceeded::rate_limit(self.limit, self.retry_after).into())
        }
    }
}

/// Fixed-window, per-identity request limiter.
///
/// Each (endpoint, identity, window index) key is counted independently, so a
/// caller can get up to twice the limit through across a window boundary.
pub struct RateLimiter {
    store: FallbackStore,
    config: RateLimitConfig,
    time_source: TimeSource,
    metrics: Arc<Metrics>,
}

impl RateLimiter {
    pub fn new(
        store: FallbackStore,
        config: RateLimitConfig,
        time_source: TimeSource,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            store,
            config,
            time_source,
            metrics,
        }
    }

    /// Limit that applies to an endpoint category
    pub fn limit_for(&self, endpoint: &str) -> EndpointLimit {
        self.config.find_limit(endpoint)
    }

    /// Count one request against `key`.
    ///
    /// The first hit in a window arms the key's expiry to `window`.
    pub async fn hit(&self, key: &str, limit: u64, window: Duration) -> Result<RateLimitDecision> {
        if window.is_zero() {
            return Err(GovernorError::Config(
                "rate limit window must be positive".to_string(),
            ));
        }

        let count = self
            .store
            .incr_by(key, 1, Expiration::ArmIfUnset(window))
            .await?
            .max(0) as u64;

        Ok(RateLimitDecision {
            allowed: count <= limit,
            limit,
            remaining: limit.saturating_sub(count),
            retry_after: window,
        })
    }

    /// Key for the window `endpoint`/`identity` falls into right now
    pub fn window_key(&self, endpoint: &str, identity: &str, window: Duration) -> String {
        generate_window_key(KEY_PREFIX, &[endpoint, identity], window, &self.time_source)
    }

    /// Count a request for `identity` on `endpoint` against its configured limit.
    ///
    /// Returns `QuotaExceeded` with the limit, zero remaining and the window
    /// length as retry-after when the caller is over the limit.
    pub async fn check(&self, endpoint: &str, identity: &str) -> Result<RateLimitDecision> {
        let limit = self.limit_for(endpoint);
        let window = limit.window();
        let key = self.window_key(endpoint, identity, window);

        let decision = self
            .hit(&key, u64::from(limit.requests_per_unit), window)
            .await?;
        self.metrics
            .record_rate_limit_decision(endpoint, decision.allowed);

        if decision.allowed {
            debug!(endpoint, identity, remaining = decision.remaining, "request allowed");
        } else {
            warn!(endpoint, identity, limit = decision.limit, "rate limit exceeded");
        }
        decision.into_result()
    }

    /// Reset all counters held in memory (test/admin use)
    pub async fn clear(&self) {
        if let Err(e) = self.store.reset().await {
            warn!(error = %e, "rate limiter reset failed");
        }
    }
}
