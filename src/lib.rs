//! Rust Governor
//!
//! Resource governance for an HTTP API: a JSON response cache, fixed-window
//! per-identity rate limiting and daily usage budgets with concurrent-stream
//! admission. Every service prefers a shared Redis backend and transparently
//! falls back to a process-local store when Redis is unreachable.

pub mod cache;
pub mod config;
pub mod error;
pub mod gate;
pub mod limiter;
pub mod memory;
pub mod metrics;
pub mod redis;
pub mod service;
pub mod store;
pub mod usage;
pub mod utils;

// Re-export main types
pub use cache::CacheService;
pub use config::{load_config, GovernorConfig};
pub use error::{GovernorError, QuotaExceeded, QuotaKind, Result};
pub use gate::{enforce_rate_limit, Identity, RouteGate};
pub use limiter::{RateLimitDecision, RateLimiter};
pub use service::Governor;
pub use store::{BackendStatus, CounterStore, Expiration, Layer};
pub use usage::UsageLimiter;
