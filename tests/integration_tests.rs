use async_trait::async_trait;
use axum::{
    body::{to_bytes, Body},
    extract::State,
    http::{header::RETRY_AFTER, Request, StatusCode},
    middleware,
    routing::post,
    Extension, Json, Router,
};
use rust_governor::{
    config::{load_config_from_yaml, EndpointLimit, GovernorConfig},
    error::{GovernorError, QuotaKind, Result},
    gate::{enforce_rate_limit, Identity, RouteGate, HEADER_LIMIT, HEADER_REMAINING},
    metrics::Metrics,
    service::Governor,
    store::{BackendStatus, CounterStore, Expiration},
    utils::TimeSource,
};
use serde_json::{json, Value};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio_test::{assert_err, assert_ok};
use tower::ServiceExt;

/// Remote backend that is permanently down
#[derive(Default)]
struct DownStore {
    calls: AtomicUsize,
}

impl DownStore {
    fn fail<T>(&self) -> Result<T> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(GovernorError::Backend("connection refused".to_string()))
    }
}

#[async_trait]
impl CounterStore for DownStore {
    fn name(&self) -> &'static str {
        "down"
    }

    async fn get(&self, _key: &str) -> Result<Option<String>> {
        self.fail()
    }

    async fn set(&self, _key: &str, _value: &str, _ttl: Duration) -> Result<()> {
        self.fail()
    }

    async fn incr_by(&self, _key: &str, _delta: i64, _expiration: Expiration) -> Result<i64> {
        self.fail()
    }

    async fn incr_within(
        &self,
        _key: &str,
        _delta: i64,
        _limit: i64,
        _expiration: Expiration,
    ) -> Result<Option<i64>> {
        self.fail()
    }

    async fn decr(&self, _key: &str) -> Result<i64> {
        self.fail()
    }

    async fn expire(&self, _key: &str, _ttl: Duration) -> Result<bool> {
        self.fail()
    }

    async fn delete(&self, _key: &str) -> Result<()> {
        self.fail()
    }

    async fn reset(&self) -> Result<()> {
        self.fail()
    }

    async fn health_check(&self) -> Result<()> {
        self.fail()
    }
}

fn config_with_limit(endpoint: &str, limit: u32) -> GovernorConfig {
    let mut config = GovernorConfig::default();
    config.redis.enabled = false;
    config
        .rate_limit
        .endpoints
        .insert(endpoint.to_string(), EndpointLimit::per_minute(limit));
    config
}

fn governor(config: &GovernorConfig, remote: Option<Arc<dyn CounterStore>>) -> Arc<Governor> {
    // two seconds into a minute and into a day
    let time_source = TimeSource::manual(86_400 * 20_000 + 2);
    Arc::new(
        Governor::with_remote(config, remote, time_source, Arc::new(Metrics::new().unwrap()))
            .unwrap(),
    )
}

async fn search(Extension(Identity(identity)): Extension<Identity>) -> Json<Value> {
    Json(json!({ "results": [], "identity": identity }))
}

async fn chat(
    State(governor): State<Arc<Governor>>,
    Extension(Identity(identity)): Extension<Identity>,
) -> std::result::Result<Json<Value>, GovernorError> {
    governor.usage().consume(&identity, "chat", 1).await?;
    Ok(Json(json!({ "answer": "ok" })))
}

fn app(governor: Arc<Governor>) -> Router {
    let search_gate = RouteGate::new(governor.clone(), "search");
    Router::new()
        .route(
            "/search",
            post(search).route_layer(middleware::from_fn_with_state(search_gate, enforce_rate_limit)),
        )
        .route("/chat", post(chat))
        .with_state(governor)
}

fn request(uri: &str, identity: &str) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .extension(Identity(identity.to_string()))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn test_second_request_in_window_gets_429() {
    let governor = governor(&config_with_limit("search", 1), None);
    let app = app(governor);

    let first = app.clone().oneshot(request("/search", "alice")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()[HEADER_LIMIT], "1");
    assert_eq!(first.headers()[HEADER_REMAINING], "0");

    let second = app.clone().oneshot(request("/search", "alice")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers()[RETRY_AFTER], "60");

    let body = to_bytes(second.into_body(), usize::MAX).await.unwrap();
    let body: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(body["detail"], "Rate limit exceeded. Please retry later.");

    // other identities have their own window
    let other = app.oneshot(request("/search", "bob")).await.unwrap();
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn test_daily_budget_is_a_429_from_a_handler() {
    let mut config = config_with_limit("search", 10);
    config.usage.daily_budget_units = 1;
    let app = app(governor(&config, None));

    // 0 -> 1 and 1 -> 2 are admitted, the budget is soft
    for _ in 0..2 {
        let response = app.clone().oneshot(request("/chat", "alice")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    let response = app.oneshot(request("/chat", "alice")).await.unwrap();
    assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    assert!(response.headers().get(RETRY_AFTER).is_some());
}

#[tokio::test]
async fn test_repeated_query_is_served_from_cache() {
    let governor = governor(&GovernorConfig::default(), None);
    let cache = governor.cache();
    let ttl = cache.ttl_for("search");
    assert_eq!(ttl, Duration::from_secs(600));

    let counter = AtomicUsize::new(0);
    let calls = &counter;
    for _ in 0..2 {
        let results: std::result::Result<Value, GovernorError> = cache
            .memoize("search:alice:5:rust", ttl, || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "results": [{ "text": "ownership", "score": 0.92 }] }))
            })
            .await;
        assert_ok!(results);
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_everything_enforced_with_redis_down() {
    let mut config = config_with_limit("upload", 1);
    config.usage.daily_budget_units = 1;
    config.usage.max_concurrent_streams = 1;

    let remote = Arc::new(DownStore::default());
    let governor = governor(&config, Some(remote.clone()));
    assert_eq!(governor.backend_status().await, BackendStatus::Unavailable);

    // cache
    governor
        .cache()
        .set("k", &json!("v"), Duration::from_secs(60))
        .await
        .unwrap();
    assert_eq!(governor.cache().get("k").await, Some(json!("v")));

    // rate limit
    assert_ok!(governor.rate_limiter().check("upload", "alice").await);
    let err = assert_err!(governor.rate_limiter().check("upload", "alice").await);
    assert_eq!(err.quota().map(|q| q.kind), Some(QuotaKind::RateLimit));

    // daily budget
    assert_ok!(governor.usage().consume("alice", "chat", 2).await);
    let err = assert_err!(governor.usage().consume("alice", "chat", 1).await);
    assert_eq!(err.quota().map(|q| q.kind), Some(QuotaKind::DailyBudget));

    // concurrent streams
    assert_ok!(governor.usage().acquire("alice").await);
    let err = assert_err!(governor.usage().acquire("alice").await);
    assert_eq!(err.quota().map(|q| q.kind), Some(QuotaKind::ConcurrentStreams));
    assert_ok!(governor.usage().release("alice").await);
    assert_ok!(governor.usage().acquire("alice").await);

    assert!(remote.calls.load(Ordering::SeqCst) > 0);
    assert!(governor.metrics().backend_fallbacks("incr_by") > 0);
}

#[tokio::test]
async fn test_gate_through_failing_remote() {
    let remote: Arc<dyn CounterStore> = Arc::new(DownStore::default());
    let app = app(governor(&config_with_limit("search", 1), Some(remote)));

    let first = app.clone().oneshot(request("/search", "alice")).await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    let second = app.oneshot(request("/search", "alice")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
}

#[test]
fn test_yaml_configuration_drives_limits() {
    let yaml = r#"
redis:
  enabled: false
rate_limit:
  endpoints:
    summarize:
      requests_per_unit: 2
      unit: hour
usage:
  max_concurrent_streams: 1
"#;
    let config = load_config_from_yaml(yaml).unwrap();
    let governor = governor(&config, None);

    tokio_test::block_on(async {
        assert_ok!(governor.rate_limiter().check("summarize", "alice").await);
        assert_ok!(governor.rate_limiter().check("summarize", "alice").await);
        let err = assert_err!(governor.rate_limiter().check("summarize", "alice").await);
        assert_eq!(
            err.quota().and_then(|q| q.retry_after),
            Some(Duration::from_secs(3600))
        );
    });
}
