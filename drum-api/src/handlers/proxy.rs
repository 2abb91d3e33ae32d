use crate::state::{status, ApiError, AppState};
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header::{HeaderMap, HeaderName, HeaderValue};
use axum::http::Request;
use axum::response::Response;
use bytes::Bytes;
use drum_core::{RouterError, Task, UpstreamResponse};
use drum_store::CachedResponse;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CacheMode {
    Skip,
    Use,
    Replace,
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn parse_cache_mode(headers: &HeaderMap, admin: bool) -> Result<CacheMode, Response> {
    let raw = headers
        .get("x-cache")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("0");
    let mode = match raw.trim().parse::<i32>() {
        Ok(0) => CacheMode::Skip,
        Ok(1) => CacheMode::Use,
        Ok(2) => CacheMode::Replace,
        _ => return Err(ApiError::detail(900, "invalid `x-cache` header")),
    };
    if admin && mode != CacheMode::Skip {
        return Err(ApiError::detail(900, "invalid `x-cache` header"));
    }
    Ok(mode)
}

/// Copy `x-login` / `x-admin` from the request back onto the response.
fn echo_headers(request_headers: &HeaderMap, response_headers: &mut HeaderMap) {
    for name in ["x-login", "x-admin"] {
        if let Some(value) = request_headers.get(name) {
            if let Ok(name) = HeaderName::from_bytes(name.as_bytes()) {
                response_headers.insert(name, value.clone());
            }
        }
    }
}

fn insert_upstream_headers(response_headers: &mut HeaderMap, upstream: &[(String, String)]) {
    for (name, value) in upstream {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                response_headers.insert(name, value);
            }
            _ => warn!(header = %name, "unrepresentable upstream header skipped"),
        }
    }
}

fn cached_response(request_headers: &HeaderMap, cached: CachedResponse) -> Response {
    let mut response = Response::new(Body::from(cached.body));
    *response.status_mut() = status(cached.status);
    let headers = response.headers_mut();
    echo_headers(request_headers, headers);
    headers.insert("x-cache", HeaderValue::from_static("1"));
    insert_upstream_headers(headers, &cached.headers);
    response
}

fn final_response(
    request_headers: &HeaderMap,
    task: &Task,
    upstream: Option<UpstreamResponse>,
) -> Response {
    let (code, body) = match &upstream {
        Some(resp) => (resp.status, Body::from(resp.body.clone())),
        None => (910, Body::empty()),
    };
    let mut response = Response::new(body);
    *response.status_mut() = status(code);
    let headers = response.headers_mut();
    echo_headers(request_headers, headers);
    if let Some(account) = task.account() {
        if let Ok(value) = HeaderValue::from_str(&account) {
            headers.insert("x-account", value);
        }
    }
    headers.insert("x-cache", HeaderValue::from_static("0"));
    if let Some(resp) = &upstream {
        insert_upstream_headers(headers, &resp.headers);
    }
    response
}

/// `/api/{rest}`, the proxy endpoint itself.
pub async fn route_all(
    State(state): State<Arc<AppState>>,
    Query(query_map): Query<HashMap<String, String>>,
    request: Request<Body>,
) -> Response {
    let donor = &state.config.donor;
    let method = request.method().as_str().to_uppercase();
    let path = request.uri().path().to_string();
    let raw_query = request.uri().query().unwrap_or("").to_string();
    let request_headers = request.headers().clone();

    let passthrough: HashMap<String, String> = request_headers
        .iter()
        .filter_map(|(name, value)| {
            let name = name.as_str().to_lowercase();
            donor
                .api_passthrough_headers
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(&name))
                .then(|| value.to_str().ok().map(|v| (name, v.to_string())))
                .flatten()
        })
        .collect();

    let body: Bytes = if matches!(method.as_str(), "PUT" | "POST" | "PATCH") {
        match axum::body::to_bytes(request.into_body(), usize::MAX).await {
            Ok(body) => body,
            Err(_) => return ApiError::detail(900, "unable to read request body"),
        }
    } else {
        Bytes::new()
    };

    let admin = header_str(&request_headers, "x-admin").is_some();
    let account = header_str(&request_headers, "x-account");
    let login = header_str(&request_headers, "x-login");
    if admin && account.is_none() {
        return ApiError::detail(900, "invalid `x-admin` request (no `x-account` specified)");
    }
    let cache_mode = match parse_cache_mode(&request_headers, admin) {
        Ok(mode) => mode,
        Err(response) => return response,
    };

    // ── Cache read ────────────────────────────────────────────
    if !admin && donor.http_cache_enabled && cache_mode == CacheMode::Use {
        let key = state
            .http_cache
            .make_request_key(&method, &path, &passthrough, &raw_query, &body);
        if let Some(login) = &login {
            state.http_cache.note_lookup_user(&key, login);
        }
        match state.http_cache.get(&key, true).await {
            Ok(Some(serialized)) => match CachedResponse::from_bytes(&serialized) {
                Ok(cached) => return cached_response(&request_headers, cached),
                Err(err) => warn!(error = %err, "cache entry is unreadable"),
            },
            Ok(None) => {}
            Err(err) => warn!(error = %err, "cache read failed"),
        }
    }

    // ── User quota ────────────────────────────────────────────
    if !admin {
        if let Some(login) = &login {
            let exceeded = {
                let user = state.get_or_create_user(login);
                !state.is_unlimited_user(login) && user.quota.limits_exceeded(&path)
            };
            if exceeded {
                return ApiError::detail(929, "daily limits exceeded");
            }
        }
    }

    // ── Schedule & wait ───────────────────────────────────────
    let task = Arc::new(
        Task::new(&method, &path)
            .with_headers(passthrough.clone())
            .with_query(&raw_query, query_map)
            .with_body(body.clone())
            .with_account(account)
            .with_group(header_str(&request_headers, "x-group"))
            .with_login(login.clone())
            .with_admin(admin),
    );

    let deadline = Duration::from_secs_f64(state.config.api.task_timeout);
    let outcome = tokio::time::timeout(deadline, async {
        state.manager.add_task(Arc::clone(&task)).await?;
        task.wait().await;
        Ok::<(), RouterError>(())
    })
    .await;
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            return ApiError::detail(900, format!("unable to process request: {err}"));
        }
        Err(_) => {
            state.record_code(905);
            return ApiError::detail(905, "timeout");
        }
    }

    // ── Statistics & user usage ───────────────────────────────
    let upstream = task.result();
    if !admin {
        if let Some(resp) = &upstream {
            if let Some(login) = &login {
                state.get_or_create_user(login).quota.inc_usage(&path);
            }
            state.record_code(resp.status);
            state.record_size(resp.body.len());
        } else {
            state.record_code(910);
        }
    } else if upstream.is_none() {
        state.record_code(910);
    }

    // ── Cache write ───────────────────────────────────────────
    if !admin
        && donor.http_cache_enabled
        && matches!(cache_mode, CacheMode::Use | CacheMode::Replace)
        && !task.is_failed()
    {
        if let Some(resp) = &upstream {
            if resp.body.len() <= donor.http_cache_item_maxsize {
                let ttl = if resp.body.len() > donor.http_cache_size_threshold {
                    donor.http_cache_short_ttl
                } else {
                    donor.http_cache_default_ttl
                };
                let key = state
                    .http_cache
                    .make_request_key(&method, &path, &passthrough, &raw_query, &body);
                let cached = CachedResponse {
                    status: resp.status,
                    headers: resp.headers.clone(),
                    body: resp.body.to_vec(),
                };
                match cached.to_bytes() {
                    Ok(bytes) => {
                        if let Err(err) = state.http_cache.set(&key, bytes, Some(ttl)).await {
                            warn!(error = %err, "cache write failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "cache serialization failed"),
                }
            }
        }
    }

    final_response(&request_headers, &task, upstream)
}
