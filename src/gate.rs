//! HTTP surface of the governor: 429 responses and the per-route rate limit
//! middleware.

use axum::{
    extract::{ConnectInfo, Request, State},
    http::{HeaderMap, HeaderValue, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use tracing::error;

use crate::{
    error::{GovernorError, QuotaExceeded},
    service::Governor,
};

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";

/// Fallback identity when neither an authenticated user nor a peer address is known
pub const ANONYMOUS: &str = "anonymous";

/// Caller identity, inserted as a request extension by the authentication layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity(pub String);

impl IntoResponse for QuotaExceeded {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "detail": self.detail(),
            "limit": self.limit,
            "remaining": self.remaining,
            "retry_after": self.retry_after.map(|d| d.as_secs()),
        }));

        let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
        let headers = response.headers_mut();
        insert_limit_headers(headers, self.limit, self.remaining);
        if let Some(retry_after) = self.retry_after {
            headers.insert(
                axum::http::header::RETRY_AFTER,
                HeaderValue::from(retry_after.as_secs()),
            );
        }
        response
    }
}

impl IntoResponse for GovernorError {
    fn into_response(self) -> Response {
        match self {
            GovernorError::QuotaExceeded(quota) => quota.into_response(),
            other => {
                error!(error = %other, "governor failure");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

fn insert_limit_headers(headers: &mut HeaderMap, limit: u64, remaining: u64) {
    headers.insert(HEADER_LIMIT, HeaderValue::from(limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(remaining));
}

/// Who a request is counted against: the authenticated identity, else the
/// peer IP, else [`ANONYMOUS`].
pub fn resolve_identity(req: &Request) -> String {
    if let Some(Identity(identity)) = req.extensions().get::<Identity>() {
        return identity.clone();
    }
    match req.extensions().get::<ConnectInfo<SocketAddr>>() {
        Some(ConnectInfo(addr)) => addr.ip().to_string(),
        None => ANONYMOUS.to_string(),
    }
}

/// State for [`enforce_rate_limit`]: which endpoint category a route counts as
#[derive(Clone)]
pub struct RouteGate {
    governor: Arc<Governor>,
    endpoint: Arc<str>,
}

impl RouteGate {
    pub fn new(governor: Arc<Governor>, endpoint: &str) -> Self {
        Self {
            governor,
            endpoint: Arc::from(endpoint),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

/// Middleware counting every request against the route's endpoint limit.
///
/// ```ignore
/// let gate = RouteGate::new(governor.clone(), "search");
/// Router::new()
///     .route("/search", post(search))
///     .route_layer(middleware::from_fn_with_state(gate, enforce_rate_limit));
/// ```
pub async fn enforce_rate_limit(State(gate): State<RouteGate>, req: Request, next: Next) -> Response {
    let identity = resolve_identity(&req);

    match gate
        .governor
        .rate_limiter()
        .check(gate.endpoint(), &identity)
        .await
    {
        Ok(decision) => {
            let mut response = next.run(req).await;
            insert_limit_headers(response.headers_mut(), decision.limit, decision.remaining);
            response
        }
        Err(e) => e.into_response(),
    }
}
