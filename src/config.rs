use serde::{Deserialize, Serialize};
use std::{collections::HashMap, time::Duration};

use crate::{
    error::{GovernorError, Result},
    redis::RedisConfig,
    utils::Unit,
};

/// Top-level configuration for the governance layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GovernorConfig {
    pub redis: RedisConfig,
    pub local: LocalStoreConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub usage: UsageConfig,
    pub server: ServerConfig,
}

/// Bounds for the process-local fallback maps (one map per service)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalStoreConfig {
    /// Hard cap; least recently used entries are evicted beyond it.
    pub capacity: usize,
    /// Expired entries are purged once the map grows past this size.
    pub purge_threshold: usize,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            capacity: 100_000,
            purge_threshold: 10_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    pub default_ttl_secs: u64,
    /// TTL per cached-result category (chat, summary, search, ...)
    pub ttl_secs: HashMap<String, u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let ttl_secs = [("chat", 1800), ("summary", 1800), ("search", 600)]
            .into_iter()
            .map(|(category, ttl)| (category.to_string(), ttl))
            .collect();

        Self {
            enabled: true,
            default_ttl_secs: 600,
            ttl_secs,
        }
    }
}

impl CacheConfig {
    pub fn ttl_for(&self, category: &str) -> Duration {
        let secs = self
            .ttl_secs
            .get(category)
            .copied()
            .unwrap_or(self.default_ttl_secs);
        Duration::from_secs(secs)
    }
}

/// Limit for one endpoint category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointLimit {
    pub requests_per_unit: u32,
    #[serde(default = "default_unit")]
    pub unit: Unit,
}

fn default_unit() -> Unit {
    Unit::Minute
}

impl EndpointLimit {
    pub fn per_minute(requests_per_unit: u32) -> Self {
        Self {
            requests_per_unit,
            unit: Unit::Minute,
        }
    }

    pub fn window(&self) -> Duration {
        self.unit.to_duration()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Used by any endpoint category without an entry in `endpoints`.
    pub default: EndpointLimit,
    pub endpoints: HashMap<String, EndpointLimit>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let endpoints = [
            ("upload", 20),
            ("chat", 30),
            ("summarize", 10),
            ("search", 60),
            ("users", 60),
            ("notes", 120),
        ]
        .into_iter()
        .map(|(endpoint, limit)| (endpoint.to_string(), EndpointLimit::per_minute(limit)))
        .collect();

        Self {
            default: EndpointLimit::per_minute(120),
            endpoints,
        }
    }
}

impl RateLimitConfig {
    /// Find the limit for an endpoint category, falling back to the default
    pub fn find_limit(&self, endpoint: &str) -> EndpointLimit {
        self.endpoints.get(endpoint).copied().unwrap_or(self.default)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UsageConfig {
    pub daily_budget_units: u64,
    pub max_concurrent_streams: u64,
    pub stream_slot_ttl_secs: u64,
}

impl Default for UsageConfig {
    fn default() -> Self {
        Self {
            daily_budget_units: 500,
            max_concurrent_streams: 2,
            stream_slot_ttl_secs: 120,
        }
    }
}

impl UsageConfig {
    pub fn stream_slot_ttl(&self) -> Duration {
        Duration::from_secs(self.stream_slot_ttl_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_addr: String,
    /// Mounts `POST /admin/reset`. Off by default: the route wipes local
    /// enforcement state and has no authentication of its own.
    pub admin_enabled: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: "0.0.0.0:8080".to_string(),
            admin_enabled: false,
        }
    }
}

impl GovernorConfig {
    /// Reject configuration that would break an invariant at runtime.
    /// Called once at startup; failures are fatal.
    pub fn validate(&self) -> Result<()> {
        fn ensure(condition: bool, message: &str) -> Result<()> {
            if condition {
                Ok(())
            } else {
                Err(GovernorError::Config(message.to_string()))
            }
        }

        if self.redis.enabled {
            ensure(!self.redis.url.trim().is_empty(), "redis.url must not be empty")?;
        }
        ensure(
            self.redis.connection_timeout_ms > 0,
            "redis.connection_timeout_ms must be positive",
        )?;
        ensure(
            self.redis.command_timeout_ms > 0,
            "redis.command_timeout_ms must be positive",
        )?;
        // A connection attempt must finish, and record its failure, inside one command.
        ensure(
            self.redis.command_timeout_ms > self.redis.connection_timeout_ms,
            "redis.command_timeout_ms must exceed redis.connection_timeout_ms",
        )?;

        ensure(self.local.capacity > 0, "local.capacity must be positive")?;
        ensure(
            self.local.purge_threshold > 0 && self.local.purge_threshold <= self.local.capacity,
            "local.purge_threshold must be between 1 and local.capacity",
        )?;

        ensure(
            self.cache.default_ttl_secs > 0,
            "cache.default_ttl_secs must be positive",
        )?;
        for (category, ttl) in &self.cache.ttl_secs {
            if *ttl == 0 {
                return Err(GovernorError::Config(format!(
                    "cache.ttl_secs.{} must be positive",
                    category
                )));
            }
        }

        ensure(
            self.rate_limit.default.requests_per_unit > 0,
            "rate_limit.default.requests_per_unit must be positive",
        )?;
        for (endpoint, limit) in &self.rate_limit.endpoints {
            if limit.requests_per_unit == 0 {
                return Err(GovernorError::Config(format!(
                    "rate_limit.endpoints.{}.requests_per_unit must be positive",
                    endpoint
                )));
            }
        }

        ensure(
            self.usage.daily_budget_units > 0,
            "usage.daily_budget_units must be positive",
        )?;
        ensure(
            self.usage.max_concurrent_streams > 0,
            "usage.max_concurrent_streams must be positive",
        )?;
        ensure(
            self.usage.stream_slot_ttl_secs > 0,
            "usage.stream_slot_ttl_secs must be positive",
        )?;

        Ok(())
    }
}

/// Load configuration from a YAML string
pub fn load_config_from_yaml(yaml: &str) -> Result<GovernorConfig> {
    let config: GovernorConfig = serde_yaml::from_str(yaml)
        .map_err(|e| GovernorError::Config(format!("Failed to parse YAML: {}", e)))?;
    config.validate()?;
    Ok(config)
}

/// Layer defaults, an optional YAML file and `GOVERNOR__*` environment variables.
///
/// `GOVERNOR__REDIS__URL=redis://cache:6379` overrides `redis.url`, and
/// `GOVERNOR__RATE_LIMIT__ENDPOINTS__CHAT__REQUESTS_PER_UNIT=10` overrides a
/// single endpoint limit.
pub fn load_config(path: Option<&str>) -> Result<GovernorConfig> {
    let mut builder =
        config::Config::builder().add_source(config::Config::try_from(&GovernorConfig::default())?);

    if let Some(path) = path {
        builder = builder.add_source(config::File::with_name(path).required(true));
    }

    let config: GovernorConfig = builder
        .add_source(
            config::Environment::with_prefix("GOVERNOR")
                .separator("__")
                .try_parsing(true),
        )
        .build()?
        .try_deserialize()?;

    config.validate()?;
    Ok(config)
}
