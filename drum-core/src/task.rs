use crate::error::RouterError;
use bytes::Bytes;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Created,
    Scheduled,
    InWork,
    Finished,
}

/// Fully-buffered upstream response as stored in the task result slot
/// and in the response cache.
#[derive(Debug, Clone, PartialEq)]
pub struct UpstreamResponse {
    pub status: u16,
    /// Response headers in arrival order.
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
    /// Final request path (after redirects), used for throttle
    /// endpoint attribution.
    pub url_path: String,
}

impl UpstreamResponse {
    pub fn is_success(&self) -> bool {
        self.status / 100 == 2
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct TaskInner {
    state: TaskState,
    account: Option<String>,
    priority: u32,
    bind_key: Option<String>,
    result: Option<UpstreamResponse>,
    error: Option<RouterError>,
}

/// One incoming API request on its way through the scheduler.
///
/// The request fields are frozen at construction; the mutable half
/// (state, pinned account, outcome) is owned by the scheduling
/// pipeline and guarded for the waiting API handler. `ready()` latches
/// the completion signal exactly once; late calls are no-ops.
pub struct Task {
    pub method: String,
    pub path: String,
    /// Passthrough headers, lowercased keys.
    pub headers: HashMap<String, String>,
    /// Raw query string as received.
    pub query: String,
    /// Parsed query parameters.
    pub query_map: HashMap<String, String>,
    pub body: Bytes,
    pub group: String,
    pub login: Option<String>,
    pub admin: bool,
    inner: Mutex<TaskInner>,
    ready_tx: watch::Sender<bool>,
}

pub const DEFAULT_GROUP: &str = "main";
pub const DEFAULT_PRIORITY: u32 = 1;
/// Priority `0` is the head of every queue; bind-cache re-pins use it.
pub const TOP_PRIORITY: u32 = 0;

impl Task {
    pub fn new(method: &str, path: &str) -> Self {
        let (ready_tx, _) = watch::channel(false);
        Self {
            method: method.to_uppercase(),
            path: path.to_string(),
            headers: HashMap::new(),
            query: String::new(),
            query_map: HashMap::new(),
            body: Bytes::new(),
            group: DEFAULT_GROUP.to_string(),
            login: None,
            admin: false,
            inner: Mutex::new(TaskInner {
                state: TaskState::Created,
                account: None,
                priority: DEFAULT_PRIORITY,
                bind_key: None,
                result: None,
                error: None,
            }),
            ready_tx,
        }
    }

    pub fn with_headers(mut self, headers: HashMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    pub fn with_query(mut self, query: &str, query_map: HashMap<String, String>) -> Self {
        self.query = query.to_string();
        self.query_map = query_map;
        self
    }

    pub fn with_body(mut self, body: Bytes) -> Self {
        self.body = body;
        self
    }

    pub fn with_account(self, account: Option<String>) -> Self {
        self.inner.lock().unwrap().account = account;
        self
    }

    pub fn with_group(mut self, group: Option<String>) -> Self {
        self.group = group.unwrap_or_else(|| DEFAULT_GROUP.to_string());
        self
    }

    pub fn with_login(mut self, login: Option<String>) -> Self {
        self.login = login;
        self
    }

    pub fn with_admin(mut self, admin: bool) -> Self {
        self.admin = admin;
        self
    }

    pub fn with_priority(self, priority: u32) -> Self {
        self.inner.lock().unwrap().priority = priority;
        self
    }

    // ── State machine ─────────────────────────────────────────

    pub fn state(&self) -> TaskState {
        self.inner.lock().unwrap().state
    }

    pub fn schedule(&self) {
        self.inner.lock().unwrap().state = TaskState::Scheduled;
    }

    pub fn work(&self) {
        self.inner.lock().unwrap().state = TaskState::InWork;
    }

    /// Terminal transition; raises the completion signal. Idempotent.
    pub fn ready(&self) {
        self.inner.lock().unwrap().state = TaskState::Finished;
        self.ready_tx.send_replace(true);
    }

    /// Block until the task is FINISHED.
    pub async fn wait(&self) {
        let mut rx = self.ready_tx.subscribe();
        let _ = rx.wait_for(|ready| *ready).await;
    }

    pub fn is_ready(&self) -> bool {
        self.state() == TaskState::Finished
    }

    pub fn is_failed(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.state == TaskState::Finished && inner.error.is_some()
    }

    // ── Mutable slots ─────────────────────────────────────────

    pub fn account(&self) -> Option<String> {
        self.inner.lock().unwrap().account.clone()
    }

    pub fn set_account(&self, email: &str) {
        self.inner.lock().unwrap().account = Some(email.to_string());
    }

    pub fn priority(&self) -> u32 {
        self.inner.lock().unwrap().priority
    }

    pub fn set_priority(&self, priority: u32) {
        self.inner.lock().unwrap().priority = priority;
    }

    pub fn bind_key(&self) -> Option<String> {
        self.inner.lock().unwrap().bind_key.clone()
    }

    pub fn set_bind_key(&self, key: &str) {
        self.inner.lock().unwrap().bind_key = Some(key.to_string());
    }

    pub fn result(&self) -> Option<UpstreamResponse> {
        self.inner.lock().unwrap().result.clone()
    }

    pub fn set_result(&self, response: UpstreamResponse) {
        self.inner.lock().unwrap().result = Some(response);
    }

    pub fn error(&self) -> Option<RouterError> {
        self.inner.lock().unwrap().error.clone()
    }

    pub fn fail(&self, error: RouterError) {
        self.inner.lock().unwrap().error = Some(error);
    }
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock().unwrap();
        let origin = if self.admin {
            "admin"
        } else {
            self.login.as_deref().unwrap_or("anonymous")
        };
        write!(
            f,
            "Task from \"{origin}\" by \"{}:{}\" priority {} <{} {} {}>",
            self.group,
            inner.account.as_deref().unwrap_or("any"),
            inner.priority,
            self.method,
            self.path,
            self.query,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_transitions() {
        let task = Task::new("get", "/api/wb/foo");
        assert_eq!(task.state(), TaskState::Created);
        assert_eq!(task.method, "GET");
        task.schedule();
        assert_eq!(task.state(), TaskState::Scheduled);
        task.work();
        assert_eq!(task.state(), TaskState::InWork);
        task.ready();
        assert!(task.is_ready());
        assert!(!task.is_failed());
    }

    #[test]
    fn is_failed_requires_finished_and_error() {
        let task = Task::new("GET", "/api/wb/foo");
        task.fail(RouterError::Routing("/api/wb/foo".into()));
        assert!(!task.is_failed());
        task.ready();
        assert!(task.is_failed());
    }

    #[tokio::test]
    async fn wait_returns_after_ready() {
        let task = std::sync::Arc::new(Task::new("GET", "/api/wb/foo"));
        let waiter = {
            let task = task.clone();
            tokio::spawn(async move { task.wait().await })
        };
        task.ready();
        waiter.await.unwrap();
        // a second ready is a no-op
        task.ready();
        task.wait().await;
    }

    #[tokio::test]
    async fn wait_after_ready_returns_immediately() {
        let task = Task::new("GET", "/x");
        task.ready();
        task.wait().await;
    }

    #[test]
    fn display_shows_origin_and_request_line() {
        let task = Task::new("GET", "/api/wb/foo")
            .with_login(Some("alice".into()))
            .with_query("d1=1", HashMap::from([("d1".into(), "1".into())]));
        let line = task.to_string();
        assert!(line.contains("\"alice\""));
        assert!(line.contains("GET /api/wb/foo d1=1"));
        assert!(line.contains("main:any"));
    }
}
