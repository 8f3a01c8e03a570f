// Debug binary to check Redis reachability and the fallback path at startup
// Run this with: cargo run --bin debug_startup

use anyhow::Result;
use std::{
    sync::Arc,
    time::{Duration, Instant},
};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_governor::{
    config::load_config,
    metrics::Metrics,
    redis::{RedisConfig, RedisStore},
    service::Governor,
    store::{BackendStatus, CounterStore},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with more verbose output
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting debug startup test...");

    let start_time = Instant::now();

    let config = load_config(std::env::var("CONFIG_PATH").ok().as_deref())?;
    test_redis_connection(&config.redis).await?;
    test_governor(&config).await?;

    info!("All checks completed in {:?}", start_time.elapsed());
    Ok(())
}

async fn test_redis_connection(config: &RedisConfig) -> Result<()> {
    if !config.enabled {
        warn!("Redis disabled in configuration, skipping connection test");
        return Ok(());
    }

    info!("Testing Redis connection: {}", config.url);
    let store = RedisStore::new(config.clone())?;

    let connection_start = Instant::now();
    let result = tokio::time::timeout(Duration::from_secs(10), store.health_check()).await;

    match result {
        Ok(Ok(())) => {
            info!("Redis answered PING in {:?}", connection_start.elapsed());
        }
        Ok(Err(e)) => {
            // Not fatal: every service falls back to its local store
            warn!("Redis health check failed, services will run locally: {}", e);
        }
        Err(_) => {
            error!("Redis health check timed out after 10 seconds");
            error!("This suggests a network connectivity issue or Redis server is not responding");
        }
    }

    Ok(())
}

async fn test_governor(config: &rust_governor::GovernorConfig) -> Result<()> {
    info!("Building governor...");
    let governor = Governor::new(config, Arc::new(Metrics::new()?))?;

    let status = governor.backend_status().await;
    info!("Backend status: {}", status.as_str());
    if status == BackendStatus::Unavailable {
        warn!("Running on local fallback stores");
    }

    let identity = "debug-startup";
    let op_start = Instant::now();
    let decision = governor.rate_limiter().check("default", identity).await?;
    info!(
        "Rate limit check passed in {:?} ({} of {} remaining)",
        op_start.elapsed(),
        decision.remaining,
        decision.limit
    );

    let total = governor.usage().consume(identity, "default", 0).await?;
    info!("Usage today for {}: {} units", identity, total);

    governor.usage().acquire(identity).await?;
    governor.usage().release(identity).await?;
    info!("Stream slot acquire/release round trip ok");

    Ok(())
}
