use std::{sync::Arc, time::Duration};
use tracing::{debug, warn};

use crate::{
    config::UsageConfig,
    error::{QuotaExceeded, QuotaKind, Result},
    metrics::Metrics,
    store::{CounterStore, Expiration, FallbackStore},
    utils::{calculate_reset, generate_window_key, TimeSource, Unit},
};

/// Per-identity daily cost budget and concurrent-stream admission
pub struct UsageLimiter {
    store: FallbackStore,
    config: UsageConfig,
    time_source: TimeSource,
    metrics: Arc<Metrics>,
}

impl UsageLimiter {
    pub fn new(
        store: FallbackStore,
        config: UsageConfig,
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

    fn daily_key(&self, identity: &str, endpoint: &str) -> String {
        generate_window_key("usage", &[endpoint, identity], Unit::Day.to_duration(), &self.time_source)
    }

    fn stream_key(identity: &str) -> String {
        format!("stream:{}", identity)
    }

    /// Add `units` to today's total for `identity` on `endpoint`.
    ///
    /// The budget is soft: the call that pushes the total past the budget is
    /// admitted and only later calls are rejected. Nothing is rolled back.
    /// Returns the new total.
    pub async fn consume(&self, identity: &str, endpoint: &str, units: u64) -> Result<u64> {
        let day = Unit::Day.to_duration();
        let key = self.daily_key(identity, endpoint);
        let units = units.min(i64::MAX as u64);
        let budget = self.config.daily_budget_units;

        let total = self
            .store
            .incr_by(&key, units as i64, Expiration::ArmIfUnset(day))
            .await?
            .max(0) as u64;

        // Only calls made after the budget was already exceeded are refused.
        let before = total.saturating_sub(units);
        if before > budget {
            self.metrics.record_usage_rejection(QuotaKind::DailyBudget.as_str());
            warn!(identity, endpoint, total, budget, "daily usage budget exceeded");
            return Err(QuotaExceeded::daily_budget(budget, self.budget_resets_in()).into());
        }

        debug!(identity, endpoint, total, budget, "usage recorded");
        Ok(total)
    }

    /// Take a concurrent-stream slot for `identity`.
    ///
    /// The bound check and the increment are one atomic step on one store, so
    /// a rejected call leaves the held count untouched. The slot TTL is
    /// refreshed on every admitted acquire and only guards against leaked
    /// slots; callers must [`release`](Self::release) on every exit path.
    pub async fn acquire(&self, identity: &str) -> Result<()> {
        let key = Self::stream_key(identity);
        let limit = self.config.max_concurrent_streams;

        let admitted = self
            .store
            .incr_within(
                &key,
                1,
                limit.min(i64::MAX as u64) as i64,
                Expiration::Refresh(self.config.stream_slot_ttl()),
            )
            .await?;

        match admitted {
            Some(active) => {
                debug!(identity, active, "stream slot acquired");
                Ok(())
            }
            None => {
                self.metrics
                    .record_usage_rejection(QuotaKind::ConcurrentStreams.as_str());
                warn!(identity, limit, "too many concurrent streams");
                Err(QuotaExceeded::concurrent_streams(limit).into())
            }
        }
    }

    /// Give back a stream slot. The key disappears when no slots remain held.
    pub async fn release(&self, identity: &str) -> Result<()> {
        let remaining = self.store.decr(&Self::stream_key(identity)).await?;
        debug!(identity, remaining = remaining.max(0), "stream slot released");
        Ok(())
    }

    /// Slots currently held by `identity`
    pub async fn active_streams(&self, identity: &str) -> Result<u64> {
        let value = self.store.get(&Self::stream_key(identity)).await?;
        Ok(value
            .and_then(|count| count.parse::<i64>().ok())
            .map(|count| count.max(0) as u64)
            .unwrap_or(0))
    }

    /// Time until today's budgets reset
    pub fn budget_resets_in(&self) -> Duration {
        calculate_reset(Unit::Day.to_duration(), &self.time_source)
    }

    /// Reset all in-memory usage state (test/admin use)
    pub async fn clear(&self) {
        if let Err(e) = self.store.reset().await {
            warn!(error = %e, "usage limiter reset failed");
        }
    }
}
