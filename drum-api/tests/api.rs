//! End-to-end tests for the HTTP surface: auth, header validation,
//! cache hits, user quotas and the management endpoints; every test
//! gets a fresh in-memory state and a scripted upstream.

use async_trait::async_trait;
use axum::body::{to_bytes, Body};
use axum::http::{Method, Request, Response, StatusCode};
use bytes::Bytes;
use drum_api::{build_router, AppState};
use drum_core::{Account, RouterConfig, RouterError, Task, UpstreamResponse};
use drum_proxy::client::ApiTransport;
use drum_proxy::manager::{Manager, TransportFactory};
use drum_store::{BindCache, MemoryStore, ResponseCache};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tower::ServiceExt; // .oneshot()

// ── Scripted upstream ─────────────────────────────────────────

#[derive(Default)]
struct Upstream {
    calls: AtomicU64,
}

struct CountingTransport {
    upstream: Arc<Upstream>,
}

#[async_trait]
impl ApiTransport for CountingTransport {
    async fn send(&self, task: &Task) -> Result<UpstreamResponse, RouterError> {
        self.upstream.calls.fetch_add(1, Ordering::SeqCst);
        Ok(UpstreamResponse {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from_static(b"{\"sales\":[1,2,3]}"),
            url_path: task.path.clone(),
        })
    }
}

// ── Helpers ───────────────────────────────────────────────────

fn make_state(tweak: impl FnOnce(&mut RouterConfig)) -> (Arc<AppState>, Arc<Upstream>) {
    let mut config = RouterConfig::default();
    config.api.workers_timeout = 2.0;
    config.api.task_timeout = 5.0;
    tweak(&mut config);
    let config = Arc::new(config);
    let store = Arc::new(MemoryStore::new());
    let bind_cache = Arc::new(BindCache::new(
        store.clone(),
        config.donor.bind_requests_cache_ttl,
    ));
    let http_cache = Arc::new(ResponseCache::new(
        store,
        Some(config.donor.http_cache_capacity),
        Some(config.donor.http_cache_default_ttl),
    ));
    let upstream = Arc::new(Upstream::default());
    let factory: TransportFactory = {
        let upstream = Arc::clone(&upstream);
        Box::new(move |_account: &Account| {
            Ok(Arc::new(CountingTransport {
                upstream: Arc::clone(&upstream),
            }) as Arc<dyn ApiTransport>)
        })
    };
    let manager = Arc::new(Manager::new(Arc::clone(&config), bind_cache, factory));
    (AppState::new(config, manager, http_cache), upstream)
}

async fn call(state: &Arc<AppState>, request: Request<Body>) -> Response<Body> {
    build_router(Arc::clone(state)).oneshot(request).await.unwrap()
}

fn req(method: Method, uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri).header("x-token", "auth");
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::empty()).unwrap()
}

fn get(uri: &str, headers: &[(&str, &str)]) -> Request<Body> {
    req(Method::GET, uri, headers)
}

async fn body_json(response: Response<Body>) -> serde_json::Value {
    let bytes = to_bytes(response.into_body(), 16 * 1024 * 1024).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

async fn body_bytes(response: Response<Body>) -> Bytes {
    to_bytes(response.into_body(), 16 * 1024 * 1024).await.unwrap()
}

fn fast_account(email: &str, cost: u32) -> serde_json::Value {
    serde_json::json!({
        "email": email,
        "api_token": "t",
        "cost": cost,
        "api_cooldown_param": 0.0,
        "api_cooldown_mode": "interval",
    })
}

async fn register(state: &Arc<AppState>, account: serde_json::Value) {
    let request = Request::builder()
        .method(Method::POST)
        .uri("/router/accounts")
        .header("x-token", "auth")
        .header("content-type", "application/json")
        .body(Body::from(account.to_string()))
        .unwrap();
    let response = call(state, request).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    // let the worker reach its queue
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
}

// ── Auth & framing ────────────────────────────────────────────

#[tokio::test]
async fn missing_token_is_901() {
    let (state, _) = make_state(|_| {});
    let request = Request::builder()
        .method(Method::GET)
        .uri("/router/ping")
        .body(Body::empty())
        .unwrap();
    let response = call(&state, request).await;
    assert_eq!(response.status().as_u16(), 901);
    assert_eq!(body_json(response).await["detail"], "invalid x-token");
}

#[tokio::test]
async fn ping_returns_pong() {
    let (state, _) = make_state(|_| {});
    let response = call(&state, get("/router/ping", &[])).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().contains_key("x-process-time"));
    assert_eq!(body_json(response).await, serde_json::json!("pong"));
}

#[tokio::test]
async fn unknown_path_is_904() {
    let (state, _) = make_state(|_| {});
    let response = call(&state, get("/nowhere", &[])).await;
    assert_eq!(response.status().as_u16(), 904);
    assert_eq!(body_json(response).await["detail"], "not found");
}

#[tokio::test]
async fn admin_without_account_is_900() {
    let (state, _) = make_state(|_| {});
    let response = call(&state, get("/api/wb/x", &[("x-admin", "1")])).await;
    assert_eq!(response.status().as_u16(), 900);
}

#[tokio::test]
async fn invalid_cache_header_is_900() {
    let (state, _) = make_state(|_| {});
    let response = call(&state, get("/api/wb/x", &[("x-cache", "7")])).await;
    assert_eq!(response.status().as_u16(), 900);
    // admin requests must not ask for caching
    let response = call(
        &state,
        get(
            "/api/wb/x",
            &[("x-admin", "1"), ("x-account", "a@x"), ("x-cache", "1")],
        ),
    )
    .await;
    assert_eq!(response.status().as_u16(), 900);
}

// ── Proxying & caching ────────────────────────────────────────

#[tokio::test]
async fn second_identical_request_is_served_from_cache() {
    let (state, upstream) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;
    register(&state, fast_account("two@x", 1)).await;

    let uri = "/api/wb/x?d1=2024-05-24&d2=2024-06-22";
    let headers = [("x-cache", "1"), ("x-login", "user")];

    let first = call(&state, get(uri, &headers)).await;
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-cache"], "0");
    assert!(first.headers().contains_key("x-account"));
    let first_body = body_bytes(first).await;
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    // settle worker post-processing before reading stats
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    let sent_before = total_sent(&state).await;

    let second = call(&state, get(uri, &headers)).await;
    assert_eq!(second.status(), StatusCode::OK);
    assert_eq!(second.headers()["x-cache"], "1");
    assert_eq!(body_bytes(second).await, first_body);
    // no new upstream call, no new account stats
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);
    assert_eq!(total_sent(&state).await, sent_before);
}

async fn total_sent(state: &Arc<AppState>) -> u64 {
    let response = call(state, get("/router/accounts", &[])).await;
    let accounts = body_json(response).await;
    accounts
        .as_array()
        .unwrap()
        .iter()
        .flat_map(|account| {
            account["req_stats"]
                .as_object()
                .map(|stats| {
                    stats
                        .values()
                        .map(|counter| counter["sent"].as_u64().unwrap_or(0))
                        .sum::<u64>()
                })
        })
        .sum()
}

#[tokio::test]
async fn user_daily_limit_maps_to_929() {
    let (state, _) = make_state(|config| {
        config.api.daily_limits_per_user =
            indexmap::IndexMap::from_iter([(r"^/api/wb".to_string(), 2u64)]);
    });
    register(&state, fast_account("one@x", 0)).await;

    let headers = [("x-login", "alice")];
    for expected in [200u16, 200, 929] {
        let response = call(&state, get("/api/wb/foo", &headers)).await;
        assert_eq!(response.status().as_u16(), expected);
    }
}

#[tokio::test]
async fn unlimited_users_bypass_the_quota() {
    let (state, _) = make_state(|config| {
        config.api.daily_limits_per_user =
            indexmap::IndexMap::from_iter([(r"^/api/wb".to_string(), 1u64)]);
    });
    register(&state, fast_account("one@x", 0)).await;

    for _ in 0..3 {
        let response = call(&state, get("/api/wb/foo", &[("x-login", "cache-warmer")])).await;
        assert_eq!(response.status(), StatusCode::OK);
    }
}

#[tokio::test]
async fn no_registered_accounts_is_a_900() {
    let (state, _) = make_state(|_| {});
    let response = call(&state, get("/api/wb/foo", &[])).await;
    assert_eq!(response.status().as_u16(), 900);
    assert_eq!(
        body_json(response).await["detail"],
        "unable to process request: no workers available"
    );
}

#[tokio::test]
async fn admin_request_is_proxied_and_echoed() {
    let (state, upstream) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;

    let response = call(
        &state,
        get(
            "/api/wb/peek",
            &[("x-admin", "1"), ("x-account", "one@x"), ("x-login", "boss")],
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["x-admin"], "1");
    assert_eq!(response.headers()["x-login"], "boss");
    assert_eq!(response.headers()["x-account"], "one@x");
    assert_eq!(upstream.calls.load(Ordering::SeqCst), 1);

    // admin traffic does not touch account stats
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    assert_eq!(total_sent(&state).await, 0);
}

// ── Management surface ────────────────────────────────────────

#[tokio::test]
async fn account_crud_roundtrip() {
    let (state, _) = make_state(|_| {});
    register(&state, fast_account("one@x", 3)).await;

    let response = call(&state, get("/router/accounts/one@x", &[])).await;
    assert_eq!(response.status(), StatusCode::OK);
    let account = body_json(response).await;
    assert_eq!(account["email"], "one@x");
    assert_eq!(account["cost"], 3);
    // registering picked up the configured default routing rules
    assert_eq!(account["api_routing_rules"]["allow"][0], "^/api/wb");

    // duplicates are rejected
    let request = Request::builder()
        .method(Method::POST)
        .uri("/router/accounts")
        .header("x-token", "auth")
        .header("content-type", "application/json")
        .body(Body::from(fast_account("one@x", 3).to_string()))
        .unwrap();
    let response = call(&state, request).await;
    assert_eq!(response.status().as_u16(), 900);

    let response = call(&state, req(Method::DELETE, "/router/accounts/one@x", &[])).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let response = call(&state, get("/router/accounts/one@x", &[])).await;
    assert_eq!(response.status().as_u16(), 900);
}

#[tokio::test]
async fn stats_endpoints_report_traffic() {
    let (state, _) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;

    let response = call(&state, get("/api/wb/foo", &[("x-login", "alice")])).await;
    assert_eq!(response.status(), StatusCode::OK);

    let http = body_json(call(&state, get("/router/stats/http", &[])).await).await;
    assert_eq!(http["codes"]["200"], 1);

    let users = body_json(call(&state, get("/router/stats/users", &[])).await).await;
    assert_eq!(users[0]["login"], "alice");
    assert_eq!(users[0]["usage_total"], 1);

    let user = body_json(call(&state, get("/router/stats/users/alice", &[])).await).await;
    assert_eq!(user["usage_total"], 1);

    let missing = call(&state, get("/router/stats/users/nobody", &[])).await;
    assert_eq!(missing.status().as_u16(), 900);

    let service = body_json(call(&state, get("/router/stats/service", &[])).await).await;
    assert!(service["task_type"].is_object());
    assert!(service["worker_waiting_time"].is_object());
}

#[tokio::test]
async fn cache_stats_and_top_listing() {
    let (state, _) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;

    let uri = "/api/wb/x?d1=2024-05-24&d2=2024-06-22";
    let headers = [("x-cache", "1"), ("x-login", "alice")];
    call(&state, get(uri, &headers)).await;
    call(&state, get(uri, &headers)).await;

    let stats = body_json(call(&state, get("/router/stats/cache", &[])).await).await;
    assert_eq!(stats["lookups"], 2);
    assert_eq!(stats["hits"], 1);
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["size"], 1);

    let top = body_json(call(&state, get("/router/cache/top5", &[])).await).await;
    let top = top.as_array().unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0]["path"], "/api/wb/x");
    assert_eq!(top[0]["users"], 1);
    assert_eq!(top[0]["params"], "d1=2024-05-24&d2=2024-06-22");

    let response = call(&state, req(Method::DELETE, "/router/cache", &[])).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    let stats = body_json(call(&state, get("/router/stats/cache", &[])).await).await;
    assert_eq!(stats["size"], 0);
    assert_eq!(stats["lookups"], 0);
}

#[tokio::test]
async fn reset_clears_users_stats_and_accounts() {
    let (state, _) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;
    call(&state, get("/api/wb/foo", &[("x-login", "alice")])).await;

    let response = call(&state, req(Method::POST, "/router/reset", &[])).await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let users = body_json(call(&state, get("/router/users", &[])).await).await;
    assert_eq!(users.as_array().unwrap().len(), 0);
    let accounts = body_json(call(&state, get("/router/accounts", &[])).await).await;
    assert_eq!(accounts.as_array().unwrap().len(), 0);
    let http = body_json(call(&state, get("/router/stats/http", &[])).await).await;
    assert_eq!(http["codes"], serde_json::json!({}));
}

#[tokio::test]
async fn reset_can_keep_accounts() {
    let (state, _) = make_state(|_| {});
    register(&state, fast_account("one@x", 0)).await;
    call(&state, get("/api/wb/foo", &[("x-login", "alice")])).await;
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let response = call(
        &state,
        req(Method::POST, "/router/reset?remove_accounts=false", &[]),
    )
    .await;
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let accounts = body_json(call(&state, get("/router/accounts", &[])).await).await;
    let accounts = accounts.as_array().unwrap();
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0]["usage_total"], 0);
}
