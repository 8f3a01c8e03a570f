use async_trait::async_trait;
use redis::{aio::ConnectionManager, Script};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::{
    error::{GovernorError, Result},
    store::{CounterStore, Expiration},
    utils::ttl_secs,
};

/// INCRBY and arm the TTL in one round trip. ARGV[3] is `refresh` or `arm`.
const INCR_SCRIPT: &str = r#"
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if ARGV[3] == 'refresh' or redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[2])
end
return count
"#;

/// INCRBY only if the result stays within ARGV[2]. Returns {admitted, count};
/// a refused increment leaves the key and its TTL untouched.
const INCR_WITHIN_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current + tonumber(ARGV[1]) > tonumber(ARGV[2]) then
  return {0, current}
end
local count = redis.call('INCRBY', KEYS[1], ARGV[1])
if ARGV[4] == 'refresh' or redis.call('TTL', KEYS[1]) < 0 then
  redis.call('EXPIRE', KEYS[1], ARGV[3])
end
return {1, count}
"#;

/// DECR and drop the key once it reaches zero.
const DECR_SCRIPT: &str = r#"
local count = redis.call('DECR', KEYS[1])
if count <= 0 then
  redis.call('DEL', KEYS[1])
end
return count
"#;

/// Redis client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// When false every service runs on its local store only.
    pub enabled: bool,
    pub url: String,
    pub connection_timeout_ms: u64,
    /// Upper bound for any single remote operation, connection included.
    pub command_timeout_ms: u64,
    /// Minimum delay between two connection attempts after a failure.
    pub reconnect_backoff_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: "redis://localhost:6379".to_string(),
            connection_timeout_ms: 1_000,
            command_timeout_ms: 1_500,
            reconnect_backoff_ms: 1_000,
        }
    }
}

impl RedisConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_millis(self.reconnect_backoff_ms)
    }
}

#[derive(Default)]
struct ConnectionSlot {
    connection: Option<ConnectionManager>,
    last_failure: Option<Instant>,
}

/// Remote store on a lazily opened, memoized Redis connection.
///
/// A failed connection attempt leaves the slot empty so a later call can
/// retry once the reconnect backoff has passed.
pub struct RedisStore {
    client: redis::Client,
    slot: Mutex<ConnectionSlot>,
    incr_script: Script,
    incr_within_script: Script,
    decr_script: Script,
    config: RedisConfig,
}

impl RedisStore {
    /// Validate the URL. No connection is opened until the first operation.
    pub fn new(config: RedisConfig) -> Result<Self> {
        let client = redis::Client::open(config.url.clone()).map_err(|e| {
            GovernorError::Config(format!("invalid redis url {}: {}", config.url, e))
        })?;

        Ok(Self {
            client,
            slot: Mutex::new(ConnectionSlot::default()),
            incr_script: Script::new(INCR_SCRIPT),
            incr_within_script: Script::new(INCR_WITHIN_SCRIPT),
            decr_script: Script::new(DECR_SCRIPT),
            config,
        })
    }

    /// Return the memoized connection, opening it if needed
    async fn connection(&self) -> Result<ConnectionManager> {
        let mut slot = self.slot.lock().await;
        if let Some(connection) = &slot.connection {
            return Ok(connection.clone());
        }

        if let Some(failed_at) = slot.last_failure {
            if failed_at.elapsed() < self.config.reconnect_backoff() {
                return Err(GovernorError::Backend(
                    "redis reconnect backoff in effect".to_string(),
                ));
            }
        }

        match self.connect().await {
            Ok(connection) => {
                info!(url = %self.config.url, "Redis connection established");
                slot.connection = Some(connection.clone());
                slot.last_failure = None;
                Ok(connection)
            }
            Err(e) => {
                warn!(url = %self.config.url, error = %e, "Redis unavailable, using local fallback");
                slot.connection = None;
                slot.last_failure = Some(Instant::now());
                Err(e)
            }
        }
    }

    /// Open a connection manager and PING it, both within one `connection_timeout`.
    async fn connect(&self) -> Result<ConnectionManager> {
        let timeout = self.config.connection_timeout();

        let attempt = async {
            let connection = self.client.get_connection_manager().await?;
            let mut conn = connection.clone();
            let _: () = redis::cmd("PING").query_async(&mut conn).await?;
            Ok::<ConnectionManager, redis::RedisError>(connection)
        };

        match tokio::time::timeout(timeout, attempt).await {
            Ok(Ok(connection)) => Ok(connection),
            Ok(Err(e)) => Err(GovernorError::Redis(e)),
            Err(_) => Err(GovernorError::Backend(format!(
                "timeout while connecting to Redis ({}ms)",
                timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.connection().await?;
        let value: Option<String> = redis::cmd("GET").arg(key).query_async(&mut conn).await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("EX")
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64, expiration: Expiration) -> Result<i64> {
        let mut conn = self.connection().await?;
        let mode = match expiration {
            Expiration::ArmIfUnset(_) => "arm",
            Expiration::Refresh(_) => "refresh",
        };

        let count: i64 = self
            .incr_script
            .key(key)
            .arg(delta)
            .arg(ttl_secs(expiration.ttl()))
            .arg(mode)
            .invoke_async(&mut conn)
            .await?;
        Ok(count)
    }

    async fn incr_within(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        expiration: Expiration,
    ) -> Result<Option<i64>> {
        let mut conn = self.connection().await?;
        let mode = match expiration {
            Expiration::ArmIfUnset(_) => "arm",
            Expiration::Refresh(_) => "refresh",
        };

        let (admitted, count): (i64, i64) = self
            .incr_within_script
            .key(key)
            .arg(delta)
            .arg(limit)
            .arg(ttl_secs(expiration.ttl()))
            .arg(mode)
            .invoke_async(&mut conn)
            .await?;
        Ok((admitted == 1).then_some(count))
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut conn = self.connection().await?;
        let count: i64 = self.decr_script.key(key).invoke_async(&mut conn).await?;
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.connection().await?;
        let armed: i64 = redis::cmd("EXPIRE")
            .arg(key)
            .arg(ttl_secs(ttl))
            .query_async(&mut conn)
            .await?;
        Ok(armed == 1)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await?;
        Ok(())
    }

    /// Drop the memoized connection; the next call reconnects.
    async fn reset(&self) -> Result<()> {
        let mut slot = self.slot.lock().await;
        slot.connection = None;
        slot.last_failure = None;
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        let mut conn = self.connection().await?;
        let _: () = redis::cmd("PING").query_async(&mut conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_redis_config_defaults() {
        let config = RedisConfig::default();
        assert_eq!(config.url, "redis://localhost:6379");
        assert!(config.enabled);
        assert!(config.connection_timeout() < config.command_timeout());
    }

    #[test]
    fn test_invalid_url_is_a_config_error() {
        let config = RedisConfig {
            url: "not-a-redis-url".to_string(),
            ..Default::default()
        };
        assert!(matches!(RedisStore::new(config), Err(GovernorError::Config(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server_backs_off_before_retrying() {
        // nothing listens on port 1
        let config = RedisConfig {
            url: "redis://127.0.0.1:1".to_string(),
            connection_timeout_ms: 200,
            reconnect_backoff_ms: 60_000,
            ..Default::default()
        };
        let store = RedisStore::new(config).unwrap();

        assert!(store.get("k").await.is_err());
        match store.get("k").await {
            Err(GovernorError::Backend(msg)) => assert!(msg.contains("backoff")),
            other => panic!("expected backoff error, got {:?}", other.map(|_| ())),
        }

        // reset clears the failure so the next call tries again
        store.reset().await.unwrap();
        match store.health_check().await {
            Err(GovernorError::Backend(msg)) => assert!(!msg.contains("backoff")),
            Err(_) => {}
            Ok(()) => panic!("nothing should answer on port 1"),
        }
    }
}
