use crate::state::{status, ApiError, AppState};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use drum_core::Account;
use percent_encoding::percent_decode_str;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn ping() -> Json<&'static str> {
    Json("pong")
}

// ── Statistics ────────────────────────────────────────────────

pub async fn get_service_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "process_time": state.process_time.lock().unwrap().clone(),
        "worker_waiting_time": state.manager.worker_waiting_time(),
        "task_type": state.manager.task_type(),
    }))
}

pub async fn get_http_stats(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "codes": state.http_codes.lock().unwrap().clone(),
        "size_kb": state.http_sizes.lock().unwrap().clone(),
    }))
}

#[derive(Deserialize)]
pub struct LimitQuery {
    pub limit: Option<usize>,
}

pub async fn get_users_stats(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> Json<Value> {
    let mut stats: Vec<(String, u64)> = state
        .users
        .iter()
        .map(|user| (user.login.clone(), user.usage_total()))
        .collect();
    stats.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    if let Some(limit) = query.limit {
        stats.truncate(limit);
    }
    let stats: Vec<Value> = stats
        .into_iter()
        .map(|(login, usage_total)| json!({ "login": login, "usage_total": usage_total }))
        .collect();
    Json(json!(stats))
}

pub async fn get_user_stats(
    State(state): State<Arc<AppState>>,
    Path(login): Path<String>,
) -> Response {
    match state.users.get(&login) {
        Some(user) => Json(json!({
            "login": user.login,
            "usage_total": user.usage_total(),
        }))
        .into_response(),
        None => ApiError::detail(900, format!("user not found: {login}")),
    }
}

pub async fn get_cache_stats(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    let cache = &state.http_cache;
    Ok(Json(json!({
        "capacity": cache.capacity().await?,
        "size": cache.size().await?,
        "lookups": cache.lookups(),
        "hits": cache.hits(),
        "misses": cache.misses(),
        "hitrate": cache.hitrate(),
    })))
}

// ── Cache ─────────────────────────────────────────────────────

/// `GET /router/cache/top{n}`: the path segment is the literal
/// `top` glued to the count, e.g. `/router/cache/top10`.
pub async fn get_cache_top(
    State(state): State<Arc<AppState>>,
    Path(selector): Path<String>,
) -> Response {
    let Some(n) = selector
        .strip_prefix("top")
        .and_then(|raw| raw.parse::<i64>().ok())
    else {
        return ApiError::detail(904, "not found");
    };

    let mut requests: Vec<Value> = state
        .http_cache
        .most_common_requests(None)
        .into_iter()
        .map(|req| {
            let params = percent_decode_str(&req.params)
                .decode_utf8_lossy()
                .into_owned();
            json!({
                "key": req.key,
                "lookups": req.lookups,
                "users": req.users,
                "method": req.method,
                "path": req.path,
                "headers": req.headers,
                "params": params,
            })
        })
        .collect();
    requests.sort_by(|a, b| {
        let rank = |v: &Value| {
            (
                v["users"].as_u64().unwrap_or(0),
                v["lookups"].as_u64().unwrap_or(0),
            )
        };
        rank(b).cmp(&rank(a))
    });
    requests.truncate(n.unsigned_abs() as usize);
    Json(json!(requests)).into_response()
}

pub async fn purge_cache(State(state): State<Arc<AppState>>) -> Result<StatusCode, ApiError> {
    state.http_cache.purge().await?;
    Ok(StatusCode::NO_CONTENT)
}

// ── Users ─────────────────────────────────────────────────────

pub async fn get_users(State(state): State<Arc<AppState>>) -> Json<Value> {
    let users: Vec<Value> = state.users.iter().map(|user| user.to_json()).collect();
    Json(json!(users))
}

pub async fn get_user(State(state): State<Arc<AppState>>, Path(login): Path<String>) -> Response {
    match state.users.get(&login) {
        Some(user) => Json(user.to_json()).into_response(),
        None => ApiError::detail(900, format!("user not found: {login}")),
    }
}

// ── Accounts ──────────────────────────────────────────────────

pub async fn get_accounts(State(state): State<Arc<AppState>>) -> Json<Value> {
    let accounts: Vec<Value> = state
        .manager
        .get_all_accounts()
        .iter()
        .map(Account::to_json)
        .collect();
    Json(json!(accounts))
}

pub async fn get_account(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Response {
    match state.manager.get_account(&email) {
        Ok(account) => Json(account.to_json()).into_response(),
        Err(err) => ApiError::detail(900, err.to_string()),
    }
}

pub async fn add_account(
    State(state): State<Arc<AppState>>,
    Json(account): Json<Account>,
) -> Response {
    match state.manager.add_account(account) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::detail(900, err.to_string()),
    }
}

pub async fn remove_account(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Response {
    match state.manager.remove_account(&email) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::detail(900, err.to_string()),
    }
}

// ── Reset ─────────────────────────────────────────────────────

fn default_true() -> bool {
    true
}

#[derive(Deserialize)]
pub struct ResetQuery {
    #[serde(default = "default_true")]
    pub remove_cache: bool,
    #[serde(default = "default_true")]
    pub remove_accounts: bool,
}

pub async fn reset(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ResetQuery>,
) -> Result<StatusCode, ApiError> {
    tracing::info!("RESET");
    state.manager.clear_service_stats();
    state.users.clear();
    state.http_cache.clear_lookup_users();
    state.process_time.lock().unwrap().clear();
    state.http_codes.lock().unwrap().clear();
    state.http_sizes.lock().unwrap().clear();
    if query.remove_cache {
        state.http_cache.purge().await?;
    }
    if query.remove_accounts {
        state.manager.remove_all_accounts();
    } else {
        state.manager.reset_all_accounts();
    }
    Ok(StatusCode::NO_CONTENT)
}

pub async fn reset_accounts(State(state): State<Arc<AppState>>) -> StatusCode {
    state.manager.reset_all_accounts();
    StatusCode::NO_CONTENT
}

pub async fn reset_account(
    State(state): State<Arc<AppState>>,
    Path(email): Path<String>,
) -> Response {
    match state.manager.reset_account(&email) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => ApiError::detail(900, err.to_string()),
    }
}

pub async fn reset_users(State(state): State<Arc<AppState>>) -> StatusCode {
    state.users.clear();
    StatusCode::NO_CONTENT
}

// ── Fallback ──────────────────────────────────────────────────

pub async fn not_found() -> Response {
    (status(904), Json(json!({ "detail": "not found" }))).into_response()
}
