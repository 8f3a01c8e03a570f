use serde::{Deserialize, Serialize};
use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::{Duration, SystemTime, UNIX_EPOCH},
};

/// Wall clock used for window indices and local expiry.
///
/// The system variant reads the real clock. The manual variant is shared by
/// every clone and only moves when [`TimeSource::advance`] is called, which
/// lets tests cross window and TTL boundaries without sleeping.
#[derive(Debug, Clone)]
pub struct TimeSource {
    manual_millis: Option<Arc<AtomicU64>>,
}

impl TimeSource {
    pub fn new() -> Self {
        Self { manual_millis: None }
    }

    /// A clock frozen at `unix_secs` until advanced.
    pub fn manual(unix_secs: u64) -> Self {
        Self {
            manual_millis: Some(Arc::new(AtomicU64::new(unix_secs * 1000))),
        }
    }

    /// Move a manual clock forward. No-op on the system clock.
    pub fn advance(&self, by: Duration) {
        if let Some(millis) = &self.manual_millis {
            millis.fetch_add(by.as_millis() as u64, Ordering::SeqCst);
        }
    }

    /// Current Unix time in milliseconds
    pub fn unix_millis(&self) -> u64 {
        match &self.manual_millis {
            Some(millis) => millis.load(Ordering::SeqCst),
            None => SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as u64,
        }
    }

    /// Current Unix timestamp in seconds
    pub fn unix_now(&self) -> i64 {
        (self.unix_millis() / 1000) as i64
    }
}

impl Default for TimeSource {
    fn default() -> Self {
        Self::new()
    }
}

/// Window lengths a limit can be expressed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Unit {
    Second,
    Minute,
    Hour,
    Day,
}

impl Unit {
    pub fn to_seconds(self) -> u64 {
        match self {
            Unit::Second => 1,
            Unit::Minute => 60,
            Unit::Hour => 3600,
            Unit::Day => 86400,
        }
    }

    pub fn to_duration(self) -> Duration {
        Duration::from_secs(self.to_seconds())
    }
}

/// Index of the fixed window containing `now`: floor(now / window).
pub fn window_index(window: Duration, time_source: &TimeSource) -> i64 {
    let window_secs = window.as_secs().max(1) as i64;
    time_source.unix_now() / window_secs
}

/// Time left until the current window of length `window` rolls over.
pub fn calculate_reset(window: Duration, time_source: &TimeSource) -> Duration {
    let now = time_source.unix_now();
    let window_size = window.as_secs().max(1) as i64;
    let next_window_start = (now / window_size + 1) * window_size;

    Duration::from_secs((next_window_start - now) as u64)
}

/// Build a counter key of the form `prefix:part:...:window_index`.
pub fn generate_window_key(
    prefix: &str,
    parts: &[&str],
    window: Duration,
    time_source: &TimeSource,
) -> String {
    let mut key_parts = Vec::with_capacity(parts.len() + 2);
    key_parts.push(prefix.to_string());
    key_parts.extend(parts.iter().map(|part| part.to_string()));
    key_parts.push(window_index(window, time_source).to_string());

    key_parts.join(":")
}

/// Whole seconds for a remote TTL, never below one.
pub fn ttl_secs(ttl: Duration) -> u64 {
    let secs = ttl.as_secs();
    if ttl.subsec_nanos() > 0 {
        secs + 1
    } else {
        secs.max(1)
    }
}
