use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use dashmap::DashMap;
use drum_core::{pattern, Counter, RouterConfig, RouterError, User};
use drum_proxy::Manager;
use drum_store::ResponseCache;
use std::sync::{Arc, Mutex};

/// Everything the HTTP handlers share.
pub struct AppState {
    pub config: Arc<RouterConfig>,
    pub manager: Arc<Manager>,
    pub http_cache: Arc<ResponseCache>,
    pub users: DashMap<String, User>,
    pub http_codes: Mutex<Counter>,
    pub http_sizes: Mutex<Counter>,
    pub process_time: Mutex<Counter>,
    /// Ascending payload-size histogram edges.
    payload_sizes: Vec<usize>,
    /// Logins matching any of these are exempt from user quotas.
    unlimited_users: Vec<String>,
}

impl AppState {
    pub fn new(
        config: Arc<RouterConfig>,
        manager: Arc<Manager>,
        http_cache: Arc<ResponseCache>,
    ) -> Arc<Self> {
        let mut payload_sizes = vec![
            4096,
            32_768,
            131_072,
            1_048_576,
            config.donor.http_cache_size_threshold,
            config.donor.http_cache_item_maxsize,
        ];
        payload_sizes.sort_unstable();
        payload_sizes.dedup();
        let unlimited_users = config.api.unlimited_users.clone();
        Arc::new(Self {
            config,
            manager,
            http_cache,
            users: DashMap::new(),
            http_codes: Mutex::new(Counter::new()),
            http_sizes: Mutex::new(Counter::new()),
            process_time: Mutex::new(Counter::new()),
            payload_sizes,
            unlimited_users,
        })
    }

    /// The user record for a login, created on first sight.
    pub fn get_or_create_user(&self, login: &str) -> dashmap::mapref::one::RefMut<'_, String, User> {
        self.users.entry(login.to_string()).or_insert_with(|| {
            User::new(login, self.config.api.daily_limits_per_user.clone())
        })
    }

    pub fn is_unlimited_user(&self, login: &str) -> bool {
        self.unlimited_users
            .iter()
            .any(|pat| pattern::matches(pat, login))
    }

    pub fn record_code(&self, code: u16) {
        self.http_codes.lock().unwrap().inc(code.to_string());
    }

    /// Payload-size histogram bucket, labeled in KiB.
    pub fn record_size(&self, len: usize) {
        let mut from = 0usize;
        let mut bucket = None;
        for edge in &self.payload_sizes {
            if len <= *edge {
                bucket = Some(format!("{}-{}", from / 1024, edge / 1024));
                break;
            }
            from = *edge;
        }
        let bucket = bucket.unwrap_or_else(|| format!("{}++", from / 1024));
        self.http_sizes.lock().unwrap().inc(bucket);
    }

    pub fn record_process_time(&self, seconds: f64) {
        self.process_time
            .lock()
            .unwrap()
            .inc((seconds as u64 + 1).to_string());
    }
}

/// Non-standard router statuses live in 900–999; `http::StatusCode`
/// admits the whole range.
pub fn status(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

/// Axum-facing wrapper: `{"detail": …}` with the router status code.
pub struct ApiError(pub RouterError);

impl ApiError {
    pub fn detail(code: u16, detail: impl Into<String>) -> Response {
        (
            status(code),
            Json(serde_json::json!({ "detail": detail.into() })),
        )
            .into_response()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        ApiError::detail(self.0.status_code(), self.0.to_string())
    }
}

impl From<RouterError> for ApiError {
    fn from(err: RouterError) -> Self {
        Self(err)
    }
}
