use async_trait::async_trait;
use lru::LruCache;
use std::{num::NonZeroUsize, time::Duration};
use tokio::sync::Mutex;
use tracing::debug;

use crate::{
    config::LocalStoreConfig,
    error::{GovernorError, Result},
    store::{CounterStore, Expiration},
    utils::TimeSource,
};

#[derive(Debug, Clone)]
struct LocalEntry {
    value: String,
    /// Unix millis; `None` means the key never expires.
    expires_at: Option<u64>,
}

impl LocalEntry {
    fn is_expired(&self, now: u64) -> bool {
        matches!(self.expires_at, Some(expires_at) if expires_at <= now)
    }
}

/// Process-local store behind a single mutex.
///
/// The map is bounded twice: once it holds more than `purge_threshold`
/// entries, expired entries are purged before a new key is inserted, and it
/// never holds more than `capacity` entries (least recently used go first).
pub struct MemoryStore {
    entries: Mutex<LruCache<String, LocalEntry>>,
    purge_threshold: usize,
    time_source: TimeSource,
}

impl MemoryStore {
    pub fn new(capacity: usize, purge_threshold: usize, time_source: TimeSource) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            purge_threshold,
            time_source,
        }
    }

    pub fn from_config(config: &LocalStoreConfig, time_source: TimeSource) -> Self {
        Self::new(config.capacity, config.purge_threshold, time_source)
    }

    /// Number of entries held, including expired ones not yet purged
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Remaining time to live of a live key
    pub async fn ttl(&self, key: &str) -> Option<Duration> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        Self::live_entry(&mut entries, key, now)
            .and_then(|entry| entry.expires_at)
            .map(|expires_at| Duration::from_millis(expires_at - now))
    }

    fn expiry_from(now: u64, ttl: Duration) -> u64 {
        now + (ttl.as_millis() as u64).max(1)
    }

    /// The entry for `key` if present and unexpired; expired entries are removed.
    fn live_entry<'a>(
        entries: &'a mut LruCache<String, LocalEntry>,
        key: &str,
        now: u64,
    ) -> Option<&'a mut LocalEntry> {
        let expired = entries.peek(key)?.is_expired(now);
        if expired {
            entries.pop(key);
            return None;
        }
        entries.get_mut(key)
    }

    fn parse_counter(key: &str, entry: &LocalEntry) -> Result<i64> {
        entry
            .value
            .parse::<i64>()
            .map_err(|_| GovernorError::Store(format!("value at {} is not an integer", key)))
    }

    fn purge_expired(entries: &mut LruCache<String, LocalEntry>, now: u64) -> usize {
        let expired: Vec<String> = entries
            .iter()
            .filter(|(_, entry)| entry.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();

        for key in &expired {
            entries.pop(key);
        }
        expired.len()
    }

    /// Add `delta` to the counter at `key` under the caller's lock. With a
    /// `limit`, an increment that would pass it changes nothing and yields `None`.
    fn add(
        &self,
        entries: &mut LruCache<String, LocalEntry>,
        key: &str,
        delta: i64,
        limit: Option<i64>,
        expiration: Expiration,
        now: u64,
    ) -> Result<Option<i64>> {
        let (current, expires_at) = match Self::live_entry(entries, key, now) {
            Some(entry) => (Self::parse_counter(key, entry)?, entry.expires_at),
            None => (0, None),
        };

        let count = current
            .checked_add(delta)
            .ok_or_else(|| GovernorError::Store(format!("counter {} overflowed", key)))?;
        if matches!(limit, Some(limit) if count > limit) {
            return Ok(None);
        }

        let expires_at = match expiration {
            Expiration::ArmIfUnset(ttl) => expires_at.or(Some(Self::expiry_from(now, ttl))),
            Expiration::Refresh(ttl) => Some(Self::expiry_from(now, ttl)),
        };

        let entry = LocalEntry {
            value: count.to_string(),
            expires_at,
        };
        self.insert(entries, key, entry, now);
        Ok(Some(count))
    }

    fn insert(
        &self,
        entries: &mut LruCache<String, LocalEntry>,
        key: &str,
        entry: LocalEntry,
        now: u64,
    ) {
        if entries.len() > self.purge_threshold && !entries.contains(key) {
            let purged = Self::purge_expired(entries, now);
            if purged > 0 {
                debug!(purged, remaining = entries.len(), "purged expired local entries");
            }
        }
        entries.put(key.to_string(), entry);
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        Ok(Self::live_entry(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        let entry = LocalEntry {
            value: value.to_string(),
            expires_at: Some(Self::expiry_from(now, ttl)),
        };
        self.insert(&mut entries, key, entry, now);
        Ok(())
    }

    async fn incr_by(&self, key: &str, delta: i64, expiration: Expiration) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        let count = self.add(&mut entries, key, delta, None, expiration, now)?;
        Ok(count.unwrap_or_default())
    }

    async fn incr_within(
        &self,
        key: &str,
        delta: i64,
        limit: i64,
        expiration: Expiration,
    ) -> Result<Option<i64>> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        self.add(&mut entries, key, delta, Some(limit), expiration, now)
    }

    async fn decr(&self, key: &str) -> Result<i64> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();

        let count = match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                let count = Self::parse_counter(key, entry)? - 1;
                entry.value = count.to_string();
                count
            }
            None => -1,
        };

        if count <= 0 {
            entries.pop(key);
        }
        Ok(count)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool> {
        let mut entries = self.entries.lock().await;
        let now = self.time_source.unix_millis();
        match Self::live_entry(&mut entries, key, now) {
            Some(entry) => {
                entry.expires_at = Some(Self::expiry_from(now, ttl));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.lock().await.pop(key);
        Ok(())
    }

    async fn reset(&self) -> Result<()> {
        self.entries.lock().await.clear();
        Ok(())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(time_source: &TimeSource) -> MemoryStore {
        MemoryStore::new(100, 10, time_source.clone())
    }

    #[tokio::test]
    async fn test_set_get_and_expiry() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);

        store.set("k", "v", Duration::from_secs(10)).await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));

        time_source.advance(Duration::from_secs(10));
        assert_eq!(store.get("k").await.unwrap(), None);
        // expired reads remove the entry
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_incr_arms_ttl_once() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);
        let expiration = Expiration::ArmIfUnset(Duration::from_secs(60));

        assert_eq!(store.incr_by("c", 1, expiration).await.unwrap(), 1);
        time_source.advance(Duration::from_secs(30));
        assert_eq!(store.incr_by("c", 1, expiration).await.unwrap(), 2);
        assert_eq!(store.ttl("c").await, Some(Duration::from_secs(30)));

        time_source.advance(Duration::from_secs(30));
        assert_eq!(store.incr_by("c", 1, expiration).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_incr_refresh_rearms_ttl() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);
        let expiration = Expiration::Refresh(Duration::from_secs(120));

        store.incr_by("s", 1, expiration).await.unwrap();
        time_source.advance(Duration::from_secs(100));
        store.incr_by("s", 1, expiration).await.unwrap();
        assert_eq!(store.ttl("s").await, Some(Duration::from_secs(120)));
    }

    #[tokio::test]
    async fn test_incr_within_leaves_key_untouched_past_limit() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);
        let expiration = Expiration::Refresh(Duration::from_secs(120));

        assert_eq!(store.incr_within("s", 1, 2, expiration).await.unwrap(), Some(1));
        time_source.advance(Duration::from_secs(60));
        assert_eq!(store.incr_within("s", 1, 2, expiration).await.unwrap(), Some(2));

        time_source.advance(Duration::from_secs(30));
        assert_eq!(store.incr_within("s", 1, 2, expiration).await.unwrap(), None);
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("2"));
        // a rejected increment does not re-arm the TTL
        assert_eq!(store.ttl("s").await, Some(Duration::from_secs(90)));
    }

    #[tokio::test]
    async fn test_decr_removes_at_zero() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);
        let expiration = Expiration::Refresh(Duration::from_secs(120));

        store.incr_by("s", 2, expiration).await.unwrap();
        assert_eq!(store.decr("s").await.unwrap(), 1);
        assert_eq!(store.get("s").await.unwrap().as_deref(), Some("1"));
        assert_eq!(store.decr("s").await.unwrap(), 0);
        assert_eq!(store.get("s").await.unwrap(), None);

        // decrementing a missing key never leaves a negative entry behind
        assert_eq!(store.decr("s").await.unwrap(), -1);
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn test_expire_only_existing_keys() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);

        assert!(!store.expire("missing", Duration::from_secs(5)).await.unwrap());
        store.incr_by("c", 1, Expiration::ArmIfUnset(Duration::from_secs(60))).await.unwrap();
        assert!(store.expire("c", Duration::from_secs(5)).await.unwrap());
        assert_eq!(store.ttl("c").await, Some(Duration::from_secs(5)));
    }

    #[tokio::test]
    async fn test_incr_on_text_value_is_an_error() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);

        store.set("k", "not a number", Duration::from_secs(10)).await.unwrap();
        let result = store.incr_by("k", 1, Expiration::Refresh(Duration::from_secs(1))).await;
        assert!(matches!(result, Err(GovernorError::Store(_))));
    }

    #[tokio::test]
    async fn test_expired_entries_purged_past_threshold() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);

        for i in 0..11 {
            store.set(&format!("old:{}", i), "x", Duration::from_secs(1)).await.unwrap();
        }
        assert_eq!(store.len().await, 11);

        time_source.advance(Duration::from_secs(2));
        store.set("fresh", "y", Duration::from_secs(60)).await.unwrap();
        assert_eq!(store.len().await, 1);
    }

    #[tokio::test]
    async fn test_capacity_is_a_hard_bound() {
        let time_source = TimeSource::manual(1_000);
        let store = MemoryStore::new(3, 3, time_source.clone());

        for i in 0..5 {
            store.set(&format!("k:{}", i), "x", Duration::from_secs(60)).await.unwrap();
        }
        assert_eq!(store.len().await, 3);
        assert_eq!(store.get("k:0").await.unwrap(), None);
        assert_eq!(store.get("k:4").await.unwrap().as_deref(), Some("x"));
    }

    #[tokio::test]
    async fn test_reset_clears_everything() {
        let time_source = TimeSource::manual(1_000);
        let store = store(&time_source);
        store.set("a", "1", Duration::from_secs(60)).await.unwrap();
        store.incr_by("b", 1, Expiration::Refresh(Duration::from_secs(60))).await.unwrap();

        store.reset().await.unwrap();
        assert!(store.is_empty().await);
    }
}
