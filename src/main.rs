use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rust_governor::{
    config::load_config, metrics::Metrics, service::Governor, store::BackendStatus,
};

#[derive(Clone)]
struct AppState {
    governor: Arc<Governor>,
    metrics: Arc<Metrics>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_governor=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Rust Governor");

    let config_path = std::env::var("CONFIG_PATH").ok();
    if let Some(path) = &config_path {
        info!("Loading configuration from: {}", path);
    }
    let config = load_config(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let governor = Arc::new(Governor::new(&config, metrics.clone())?);
    let state = AppState { governor, metrics };

    let http_addr = config.server.http_addr.parse::<SocketAddr>()?;
    if config.server.admin_enabled {
        warn!("Admin routes enabled on {}", http_addr);
    }
    let http_server = start_http_server(router(state, config.server.admin_enabled), http_addr);

    info!("HTTP server listening on {}", http_addr);

    // Wait for shutdown signal
    tokio::select! {
        result = http_server => {
            if let Err(e) = result {
                warn!("HTTP server error: {}", e);
            }
        }
        _ = signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    info!("Service stopped");
    Ok(())
}

fn router(state: AppState, admin_enabled: bool) -> Router {
    let mut app = Router::new()
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler));

    if admin_enabled {
        app = app.route("/admin/reset", post(reset_handler));
    }

    app.with_state(state)
}

async fn start_http_server(app: Router, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

/// Always healthy: an unreachable Redis only degrades to local stores.
async fn health_check(State(state): State<AppState>) -> Json<serde_json::Value> {
    let backend = state.governor.backend_status().await;
    let status = match backend {
        BackendStatus::Unavailable => "degraded",
        _ => "healthy",
    };

    Json(json!({
        "status": status,
        "redis": backend.as_str(),
        "timestamp": chrono::Utc::now().to_rfc3339()
    }))
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}

async fn reset_handler(State(state): State<AppState>) -> StatusCode {
    state.governor.clear().await;
    StatusCode::NO_CONTENT
}
