use crate::state::{ApiError, AppState};
use axum::body::Body;
use axum::extract::State;
use axum::http::Request;
use axum::middleware::Next;
use axum::response::Response;
use std::sync::Arc;
use std::time::Instant;

/// Every endpoint requires the shared `x-token` secret.
pub async fn require_token(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let presented = request
        .headers()
        .get("x-token")
        .and_then(|value| value.to_str().ok());
    if presented != Some(state.config.api.auth_token.as_str()) {
        return ApiError::detail(901, "invalid x-token");
    }
    next.run(request).await
}

/// Stamp `x-process-time` on every response and feed the histogram.
pub async fn process_time(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let started = Instant::now();
    let mut response = next.run(request).await;
    let elapsed = started.elapsed().as_secs_f64();
    state.record_process_time(elapsed);
    if let Ok(value) = format!("{elapsed:.4}").parse() {
        response.headers_mut().insert("x-process-time", value);
    }
    response
}
