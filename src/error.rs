use std::{fmt, time::Duration};
use thiserror::Error;

/// Result type for governor operations
pub type Result<T> = std::result::Result<T, GovernorError>;

/// Errors that can occur in the governance layer
#[derive(Error, Debug)]
pub enum GovernorError {
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Remote backend unreachable. Never leaves the fallback store.
    #[error("Backend unavailable: {0}")]
    Backend(String),

    #[error("{0}")]
    QuotaExceeded(QuotaExceeded),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl GovernorError {
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(self, GovernorError::QuotaExceeded(_))
    }

    pub fn quota(&self) -> Option<&QuotaExceeded> {
        match self {
            GovernorError::QuotaExceeded(quota) => Some(quota),
            _ => None,
        }
    }
}

impl From<QuotaExceeded> for GovernorError {
    fn from(quota: QuotaExceeded) -> Self {
        GovernorError::QuotaExceeded(quota)
    }
}

impl From<config::ConfigError> for GovernorError {
    fn from(e: config::ConfigError) -> Self {
        GovernorError::Config(e.to_string())
    }
}

/// Which gate denied the request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QuotaKind {
    RateLimit,
    DailyBudget,
    ConcurrentStreams,
}

impl QuotaKind {
    pub fn as_str(self) -> &'static str {
        match self {
            QuotaKind::RateLimit => "rate_limit",
            QuotaKind::DailyBudget => "daily_budget",
            QuotaKind::ConcurrentStreams => "concurrent_streams",
        }
    }
}

/// A denied request, with what the client needs to back off.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaExceeded {
    pub kind: QuotaKind,
    pub limit: u64,
    pub remaining: u64,
    pub retry_after: Option<Duration>,
}

impl QuotaExceeded {
    pub fn rate_limit(limit: u64, window: Duration) -> Self {
        Self {
            kind: QuotaKind::RateLimit,
            limit,
            remaining: 0,
            retry_after: Some(window),
        }
    }

    pub fn daily_budget(limit: u64, until_reset: Duration) -> Self {
        Self {
            kind: QuotaKind::DailyBudget,
            limit,
            remaining: 0,
            retry_after: Some(until_reset),
        }
    }

    pub fn concurrent_streams(limit: u64) -> Self {
        Self {
            kind: QuotaKind::ConcurrentStreams,
            limit,
            remaining: 0,
            retry_after: None,
        }
    }

    pub fn detail(&self) -> &'static str {
        match self.kind {
            QuotaKind::RateLimit => "Rate limit exceeded. Please retry later.",
            QuotaKind::DailyBudget => "Daily usage budget exceeded",
            QuotaKind::ConcurrentStreams => "Too many concurrent streams",
        }
    }
}

impl fmt::Display for QuotaExceeded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (limit {})", self.detail(), self.limit)?;
        if let Some(retry_after) = self.retry_after {
            write!(f, ", retry after {}s", retry_after.as_secs())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quota_display() {
        let err: GovernorError = QuotaExceeded::rate_limit(30, Duration::from_secs(60)).into();
        assert!(err.is_quota_exceeded());
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded. Please retry later. (limit 30), retry after 60s"
        );

        let err: GovernorError = QuotaExceeded::concurrent_streams(2).into();
        assert_eq!(err.to_string(), "Too many concurrent streams (limit 2)");
        assert_eq!(err.quota().map(|q| q.kind), Some(QuotaKind::ConcurrentStreams));
    }

    #[test]
    fn test_backend_errors_are_not_quota() {
        let err = GovernorError::Backend("connection refused".to_string());
        assert!(!err.is_quota_exceeded());
        assert!(err.quota().is_none());
    }
}
