use prometheus::{CounterVec, HistogramOpts, HistogramVec, Opts, Registry};
use std::sync::Arc;

/// Metrics collector for the governance layer
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,

    // Cache metrics
    cache_hits: CounterVec,
    cache_misses: CounterVec,

    // Gate metrics
    rate_limit_decisions: CounterVec,
    usage_rejections: CounterVec,

    // Backend metrics
    backend_fallbacks: CounterVec,
    remote_operation_duration: HistogramVec,
}

impl Metrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Arc::new(Registry::new());

        let cache_hits = CounterVec::new(
            Opts::new("governor_cache_hits_total", "Cache hits by serving layer"),
            &["layer"],
        )?;

        let cache_misses = CounterVec::new(
            Opts::new("governor_cache_misses_total", "Cache misses"),
            &["layer"],
        )?;

        let rate_limit_decisions = CounterVec::new(
            Opts::new(
                "governor_rate_limit_decisions_total",
                "Rate limit decisions by endpoint category and result",
            ),
            &["endpoint", "result"],
        )?;

        let usage_rejections = CounterVec::new(
            Opts::new(
                "governor_usage_rejections_total",
                "Requests denied by the usage limiter",
            ),
            &["gate"],
        )?;

        let backend_fallbacks = CounterVec::new(
            Opts::new(
                "governor_backend_fallbacks_total",
                "Operations served locally because the remote backend failed",
            ),
            &["operation"],
        )?;

        let remote_operation_duration = HistogramVec::new(
            HistogramOpts::new(
                "governor_remote_operation_duration_seconds",
                "Duration of remote backend operations in seconds",
            ),
            &["operation", "result"],
        )?;

        registry.register(Box::new(cache_hits.clone()))?;
        registry.register(Box::new(cache_misses.clone()))?;
        registry.register(Box::new(rate_limit_decisions.clone()))?;
        registry.register(Box::new(usage_rejections.clone()))?;
        registry.register(Box::new(backend_fallbacks.clone()))?;
        registry.register(Box::new(remote_operation_duration.clone()))?;

        Ok(Self {
            registry,
            cache_hits,
            cache_misses,
            rate_limit_decisions,
            usage_rejections,
            backend_fallbacks,
            remote_operation_duration,
        })
    }

    /// Get the Prometheus registry for this metrics instance
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn record_cache_hit(&self, layer: &str) {
        self.cache_hits.with_label_values(&[layer]).inc();
    }

    pub fn record_cache_miss(&self, layer: &str) {
        self.cache_misses.with_label_values(&[layer]).inc();
    }

    pub fn record_rate_limit_decision(&self, endpoint: &str, allowed: bool) {
        let result = if allowed { "allowed" } else { "rejected" };
        self.rate_limit_decisions
            .with_label_values(&[endpoint, result])
            .inc();
    }

    pub fn record_usage_rejection(&self, gate: &str) {
        self.usage_rejections.with_label_values(&[gate]).inc();
    }

    pub fn record_backend_fallback(&self, operation: &str) {
        self.backend_fallbacks.with_label_values(&[operation]).inc();
    }

    pub fn record_remote_operation(&self, operation: &str, ok: bool, duration_seconds: f64) {
        let result = if ok { "success" } else { "error" };
        self.remote_operation_duration
            .with_label_values(&[operation, result])
            .observe(duration_seconds);
    }

    pub fn cache_hits(&self, layer: &str) -> u64 {
        self.cache_hits.with_label_values(&[layer]).get() as u64
    }

    pub fn cache_misses(&self, layer: &str) -> u64 {
        self.cache_misses.with_label_values(&[layer]).get() as u64
    }

    /// Current value of the fallback counter for one operation
    pub fn backend_fallbacks(&self, operation: &str) -> u64 {
        self.backend_fallbacks.with_label_values(&[operation]).get() as u64
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new().expect("Failed to create default metrics")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_creation() {
        let metrics = Metrics::new().unwrap();

        metrics.record_cache_hit("remote");
        metrics.record_cache_miss("local");
        metrics.record_rate_limit_decision("search", true);
        metrics.record_usage_rejection("daily_budget");
        metrics.record_remote_operation("incr_by", true, 0.002);
        metrics.record_backend_fallback("incr_by");
        metrics.record_backend_fallback("incr_by");

        assert_eq!(metrics.backend_fallbacks("incr_by"), 2);
        assert_eq!(metrics.backend_fallbacks("get"), 0);
    }

    #[test]
    fn test_metrics_gathering() {
        let metrics = Metrics::new().unwrap();
        metrics.record_rate_limit_decision("chat", false);

        let families = metrics.registry().gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "governor_rate_limit_decisions_total"));
    }
}
