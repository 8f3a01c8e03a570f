//! Keyed counter/value store with remote-first, local-fallback semantics.
//!
//! [`CounterStore`] is implemented by the remote [`RedisStore`](crate::redis::RedisStore)
//! and the process-local [`MemoryStore`]. [`FallbackStore`] composes the two:
//! every primitive goes to the remote store first and silently falls back to
//! the local one when the remote call fails or exceeds the command timeout.

use async_trait::async_trait;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::time::Instant;
use tracing::debug;

use crate::{error::Result, memory::MemoryStore, metrics::Metrics};

/// How `incr_by` treats the key's TTL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Expiration {
    /// Arm the TTL only if the key has none yet (first use of a window).
    ArmIfUnset(Duration),
    /// Re-arm the TTL on every increment.
    Refresh(Duration),
}

impl Expiration {
    pub fn ttl(&self) -> Duration {
        match self {
            Expiration::ArmIfUnset(ttl) | Expiration::Refresh(ttl) => *ttl,
        }
    }
}

/// Storage primitives shared by the cache and the limiters
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Atomically add `delta`, creating the key at zero when missing, and
    /// apply `expiration` in the same step. Returns the new value.
    async fn incr_by(&self, key: &str, delta: i64, expiration: Expiration) -> Result<i64>;

    /// Atomically add `delta` only if the result stays at or below `limit`,
    /// applying `expiration` when it does. Returns the new value, or `None`
    /// with the key left untouched when the increment would pass `limit`.
    async fn incr_within(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        expiration: Expiration,
    ) -> Result<Option<i64>>;

    /// Atomically subtract one. A result of zero or less deletes the key.
    async fn decr(&self, key: &str) -> Result<i64>;

    /// Arm a TTL on an existing key. Returns false if the key is absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Drop all local state, or the memoized connection for a remote store.
    async fn reset(&self) -> Result<()>;

    async fn health_check(&self) -> Result<()>;
}

/// Reachability of the remote backend as seen by a [`FallbackStore`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendStatus {
    Disabled,
    Available,
    Unavailable,
}

impl BackendStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BackendStatus::Disabled => "disabled",
            BackendStatus::Available => "available",
            BackendStatus::Unavailable => "unavailable",
        }
    }
}

/// Which store answered a [`FallbackStore::lookup`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layer {
    Remote,
    Local,
}

impl Layer {
    pub fn as_str(self) -> &'static str {
        match self {
            Layer::Remote => "remote",
            Layer::Local => "local",
        }
    }
}

/// Remote store with a private local fallback.
///
/// Remote failures never reach the caller: they are logged, counted and the
/// call is served by the local store instead. Errors from the local store
/// itself are returned unchanged.
pub struct FallbackStore {
    remote: Option<Arc<dyn CounterStore>>,
    local: MemoryStore,
    command_timeout: Duration,
    metrics: Arc<Metrics>,
}

impl FallbackStore {
    pub fn new(
        remote: Option<Arc<dyn CounterStore>>,
        local: MemoryStore,
        command_timeout: Duration,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            remote,
            local,
            command_timeout,
            metrics,
        }
    }

    /// A store that never leaves the process
    pub fn local_only(local: MemoryStore, metrics: Arc<Metrics>) -> Self {
        Self::new(None, local, Duration::from_secs(1), metrics)
    }

    pub fn local(&self) -> &MemoryStore {
        &self.local
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub async fn remote_status(&self) -> BackendStatus {
        match &self.remote {
            None => BackendStatus::Disabled,
            Some(remote) => match self.attempt("health_check", remote.health_check()).await {
                Some(()) => BackendStatus::Available,
                None => BackendStatus::Unavailable,
            },
        }
    }

    /// Read `key` and report which store answered.
    ///
    /// A remote hit wins. A remote miss or failure consults the local map; a
    /// miss counts as remote only when the remote store itself answered.
    pub async fn lookup(&self, key: &str) -> Result<(Option<String>, Layer)> {
        if let Some(remote) = &self.remote {
            match self.attempt("get", remote.get(key)).await {
                Some(Some(value)) => return Ok((Some(value), Layer::Remote)),
                Some(None) => {
                    return Ok(match self.local.get(key).await? {
                        Some(value) => (Some(value), Layer::Local),
                        None => (None, Layer::Remote),
                    })
                }
                None => {}
            }
        }
        Ok((self.local.get(key).await?, Layer::Local))
    }

    /// Run one remote call under the command timeout. `None` means fall back.
    async fn attempt<T>(
        &self,
        operation: &'static str,
        call: impl Future<Output = Result<T>>,
    ) -> Option<T> {
        let started = Instant::now();
        let outcome = match tokio::time::timeout(self.command_timeout, call).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!("timed out after {:?}", self.command_timeout)),
        };

        self.metrics.record_remote_operation(
            operation,
            outcome.is_ok(),
            started.elapsed().as_secs_f64(),
        );

        match outcome {
            Ok(value) => Some(value),
            Err(reason) => {
                let backend = self.remote.as_ref().map_or("none", |remote| remote.name());
                debug!(operation, backend, %reason, "remote backend failed, serving locally");
                self.metrics.record_backend_fallback(operation);
                None
            }
        }
    }
}

#[async_trait]
impl CounterStore for FallbackStore {
    fn name(&self) -> &'static str {
        "fallback"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.lookup(key).await?.0)
    }

    /// Write-through: best effort to the remote store, always to the local map.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        if let Some(remote) = &self.remote {
            self.attempt("set", remote.set(key, value, ttl)).await;
        }
        self.local.set(key, value, ttl).await
    }

    async fn incr_by(&self, key: &str, delta: i64, expiration: Expiration) -> Result<i64> {
        if let Some(remote) = &self.remote {
            if let Some(count) = self
                .attempt("incr_by", remote.incr_by(key, delta, expiration))
                .await
            {
                return Ok(count);
            }
        }
        self.local.incr_by(key, delta, expiration).await
    }

    /// The bound check and the increment are served by one store, never split.
    async fn incr_within(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        expiration: Expiration,
    ) -> Result<Option<i64>> {
        if let Some(remote) = &self.remote {
            if let Some(admitted) = self
                .attempt("incr_within", remote.incr_within(key, delta, limit, expiration))
                .await
            {
                return Ok(admitted);
            }
        }
        self.local.incr_within(key, delta, limit, expiration).await
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        if let Some(remote) = &self.remote {
            if let Some(count) = self.attempt("decr", remote.decr(key)).await {
                return Ok(count);
            }
        }
        self.local.decr(key).await
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        if let Some(remote) = &self.remote {
            if let Some(armed) = self.attempt("expire", remote.expire(key, ttl)).await {
                return Ok(armed);
            }
        }
        self.local.expire(key, ttl).await
    }

    /// Deletes from both stores, since `set` writes to both.
    async fn delete(&self, key: &str) -> Result<()> {
        if let Some(remote) = &self.remote {
            self.attempt("delete", remote.delete(key)).await;
        }
        self.local.delete(key).await
    }

    async fn reset(&self) -> Result<()> {
        self.local.reset().await?;
        if let Some(remote) = &self.remote {
            self.attempt("reset", remote.reset()).await;
        }
        Ok(())
    }

    /// The local store is always there, so the fallback store is always healthy.
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}
