use crate::client::ApiTransport;
use crate::queue::TaskQueue;
use chrono::Utc;
use drum_core::account::{CooldownMode, CooldownParam, RuleKind, SharedAccount, WorkerState};
use drum_core::config::DonorConfig;
use drum_core::{pattern, RouterError, Task};
use drum_store::BindCache;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// In-flight upstream requests allowed per account.
const INFLIGHT_PERMITS: usize = 2;

/// Request-timestamp ring bound; the WINDOW scan never reaches past
/// its period, so old stamps are dead weight.
const REQ_TIMESTAMPS_CAP: usize = 1024;

/// Freeze-loop polling slice.
const FREEZE_SLICE: Duration = Duration::from_millis(100);

struct IntervalState {
    schedule: Vec<f64>,
    window: f64,
    pos: usize,
    started: bool,
}

/// The serial pipeline driving one account.
///
/// Drains the account's priority queue, performs the upstream call,
/// applies the outcome to the account (stats, usage, routing-rule
/// mutations), then pays the pacing cooldown and any freeze back-off
/// before touching the next task. The `free` signal is raised whenever
/// the queue runs dry, strictly before blocking on the dequeue, so
/// the Manager's open race can never miss a ready worker.
pub struct Worker {
    account: SharedAccount,
    email: String,
    uid: String,
    queue: TaskQueue,
    transport: Arc<dyn ApiTransport>,
    bind_cache: Arc<BindCache>,
    config: Arc<DonorConfig>,
    cooldown_mode: CooldownMode,
    cooldown_param: CooldownParam,
    interval: Mutex<IntervalState>,
    state: Mutex<WorkerState>,
    req_timestamps: Mutex<VecDeque<Instant>>,
    semaphore: Semaphore,
    /// Open while the account may issue the next request.
    cooldown_gate: watch::Sender<bool>,
    /// Raised while the queue is empty and the worker can take work.
    free: watch::Sender<bool>,
    shutdown: watch::Sender<bool>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    pub fn new(
        account: SharedAccount,
        transport: Arc<dyn ApiTransport>,
        bind_cache: Arc<BindCache>,
        config: Arc<DonorConfig>,
    ) -> Arc<Self> {
        let (email, uid, cooldown_param, cooldown_mode) = {
            let mut acc = account.lock().unwrap();
            // accounts without their own pacing adopt the configured one
            if acc.api_cooldown_param.is_none() {
                acc.api_cooldown_param = Some(config.api_cooldown_param.clone());
                acc.api_cooldown_mode = Some(config.api_cooldown_mode);
            }
            (
                acc.email.clone(),
                acc.uid.clone(),
                acc.api_cooldown_param.clone().unwrap_or(CooldownParam::Scalar(0.0)),
                acc.api_cooldown_mode.unwrap_or(config.api_cooldown_mode),
            )
        };

        let schedule = cooldown_param.expand();
        let window = cooldown_param.window();
        let (cooldown_gate, _) = watch::channel(true);
        let (free, _) = watch::channel(false);
        let (shutdown, _) = watch::channel(false);

        let worker = Arc::new(Self {
            account,
            email,
            uid,
            queue: TaskQueue::new(),
            transport,
            bind_cache,
            config,
            cooldown_mode,
            cooldown_param,
            interval: Mutex::new(IntervalState {
                schedule,
                window,
                pos: 0,
                started: false,
            }),
            state: Mutex::new(WorkerState::Idle),
            req_timestamps: Mutex::new(VecDeque::new()),
            semaphore: Semaphore::new(INFLIGHT_PERMITS),
            cooldown_gate,
            free,
            shutdown,
            handle: Mutex::new(None),
        });
        worker.update_state(WorkerState::Idle);
        worker
    }

    // ── Identity & state ──────────────────────────────────────

    pub fn email(&self) -> &str {
        &self.email
    }

    pub fn uid(&self) -> &str {
        &self.uid
    }

    pub fn account(&self) -> SharedAccount {
        Arc::clone(&self.account)
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock().unwrap()
    }

    fn update_state(&self, state: WorkerState) {
        *self.state.lock().unwrap() = state;
        self.account.lock().unwrap().worker_state = Some(state);
    }

    pub fn is_alive(&self) -> bool {
        matches!(
            self.state(),
            WorkerState::Waiting | WorkerState::Running | WorkerState::Cooldown | WorkerState::Frozen
        )
    }

    pub fn is_running(&self) -> bool {
        matches!(
            self.state(),
            WorkerState::Waiting | WorkerState::Running | WorkerState::Cooldown
        )
    }

    pub fn is_frozen(&self) -> bool {
        self.state() == WorkerState::Frozen
    }

    pub fn is_free(&self) -> bool {
        *self.free.borrow()
    }

    /// Wait until the worker advertises an empty queue.
    pub async fn wait_free(&self) {
        let mut rx = self.free.subscribe();
        let _ = rx.wait_for(|free| *free).await;
    }

    // ── Queue ─────────────────────────────────────────────────

    pub fn enqueue(&self, task: Arc<Task>) {
        let priority = task.priority();
        self.queue.push(priority, task);
    }

    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    // ── Cooldown policies ─────────────────────────────────────

    /// INTERVAL: next value of the cyclic schedule; a quiet period
    /// longer than one whole schedule pass restarts the cycle.
    fn interval_cooldown(&self) -> f64 {
        let mut interval = self.interval.lock().unwrap();
        if interval.schedule.is_empty() {
            return 0.0;
        }
        if !interval.started {
            interval.started = true;
        } else {
            let last = self.req_timestamps.lock().unwrap().back().copied();
            if let Some(last) = last {
                if last.elapsed().as_secs_f64() > interval.window {
                    interval.pos = 0;
                }
            }
        }
        let value = interval.schedule[interval.pos];
        interval.pos = (interval.pos + 1) % interval.schedule.len();
        value
    }

    /// WINDOW: at most one request per `window_size` inside a rolling
    /// `period`. Scans the timestamp ring newest-first, bucketing by
    /// `window_size` anchored at now.
    fn window_cooldown(&self, window_size: f64, period: f64) -> f64 {
        let now = Instant::now();
        let mut window_num: u32 = 1;
        let mut window_req: u32 = 0;
        let stamps = self.req_timestamps.lock().unwrap();
        for stamp in stamps.iter().rev() {
            let age = now.duration_since(*stamp).as_secs_f64();
            if age > f64::from(window_num) * window_size {
                if window_req <= 1 {
                    break;
                }
                window_num += 1;
                window_req = 1;
            } else {
                window_req += 1;
            }
            if age > period {
                break;
            }
        }
        if window_req <= 1 || f64::from(window_num) < period / window_size {
            0.0
        } else {
            window_size
        }
    }

    pub fn get_api_cooldown(&self) -> f64 {
        match self.cooldown_mode {
            CooldownMode::Interval => self.interval_cooldown(),
            CooldownMode::Window => match self.cooldown_param.window_pair() {
                Some((window_size, period)) => self.window_cooldown(window_size, period),
                None => {
                    warn!(account = %self.email, "window cooldown without a [size, period] pair");
                    0.0
                }
            },
        }
    }

    /// Freeze back-off bookkeeping after one request: a throttle
    /// status arms `freeze_left` and escalates the next duration up to
    /// the cap; anything else lets the duration decay back to the
    /// initial once no freeze is pending.
    fn update_freeze(&self, status: Option<u16>, freeze_time: &mut f64, freeze_left: &mut f64) {
        match status {
            Some(status) if self.config.freeze_status_codes.contains(&status) => {
                *freeze_left = *freeze_time;
                *freeze_time = (*freeze_time * self.config.freeze_time_factor)
                    .min(self.config.freeze_time_max);
            }
            _ => {
                if *freeze_left == 0.0 {
                    *freeze_time = self.config.freeze_time_initial;
                }
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────

    pub fn start(self: &Arc<Self>) {
        let mut handle = self.handle.lock().unwrap();
        if handle.is_none() {
            self.update_state(WorkerState::Running);
            let worker = Arc::clone(self);
            *handle = Some(tokio::spawn(worker.run()));
        }
    }

    pub fn stop(&self) {
        self.shutdown.send_replace(true);
    }

    async fn run(self: Arc<Self>) {
        info!(account = %self.email, "running worker");
        self.update_state(WorkerState::Running);
        let mut shutdown = self.shutdown.subscribe();
        let mut freeze_time = self.config.freeze_time_initial;
        let mut freeze_left: f64 = 0.0;

        loop {
            if self.account.lock().unwrap().banned {
                break;
            }
            self.update_state(WorkerState::Waiting);

            if self.queue.is_empty() {
                self.free.send_replace(true);
            }
            let (_, task) = tokio::select! {
                item = self.queue.pop() => item,
                _ = shutdown.wait_for(|stop| *stop) => break,
            };
            self.free.send_replace(false);

            tokio::select! {
                _ = self.process(&task, &mut freeze_time, &mut freeze_left) => {}
                _ = shutdown.wait_for(|stop| *stop) => {
                    if !task.is_ready() {
                        task.fail(RouterError::Cancelled);
                        task.ready();
                    }
                    break;
                }
            }
        }

        info!(account = %self.email, "terminating worker");
        self.update_state(WorkerState::Terminated);
    }

    /// One full task iteration: gate, checks, upstream call, outcome
    /// application, cooldown, freeze.
    async fn process(&self, task: &Arc<Task>, freeze_time: &mut f64, freeze_left: &mut f64) {
        // wait out the previous request's cooldown
        {
            let mut gate = self.cooldown_gate.subscribe();
            let _ = gate.wait_for(|open| *open).await;
        }
        let _permit = self.semaphore.acquire().await.ok();

        let route = if task.admin {
            "*".to_string()
        } else {
            let resolved = {
                let mut acc = self.account.lock().unwrap();
                acc.get_route(&task.path)
            };
            let Some(route) = resolved else {
                warn!(account = %self.email, path = %task.path, "task has forbidden route");
                task.fail(RouterError::Routing(task.path.clone()));
                task.ready();
                return;
            };
            if self.account.lock().unwrap().limits_exceeded(&task.path) {
                warn!(account = %self.email, path = %task.path, "account exceeded limits");
                task.fail(RouterError::Limits(task.path.clone()));
                task.ready();
                return;
            }
            route
        };

        self.update_state(WorkerState::Running);
        task.set_account(&self.email);
        task.work();
        info!(account = %self.email, task = %task, "task in work");

        let mut status_code: Option<u16> = None;
        match self.transport.send(task).await {
            Ok(response) => {
                status_code = Some(response.status);
                let success = response.is_success();
                let status = response.status;
                task.set_result(response);
                if !success {
                    task.fail(RouterError::Upstream(format!("status code: {status}")));
                    error!(account = %self.email, status, "task failed");
                }
            }
            Err(err) => {
                error!(account = %self.email, error = %err, "task failed");
                task.fail(err);
            }
        }
        task.ready();

        {
            let mut stamps = self.req_timestamps.lock().unwrap();
            stamps.push_back(Instant::now());
            while stamps.len() > REQ_TIMESTAMPS_CAP {
                stamps.pop_front();
            }
        }

        if !task.admin {
            self.apply_outcome(task, &route, status_code).await;
        }

        // pace: hold the gate closed for the cooldown, then reopen
        self.cooldown_gate.send_replace(false);
        let cooldown = self.get_api_cooldown();
        if cooldown > 0.0 {
            debug!(account = %self.email, cooldown, "cooldown");
        }
        self.update_state(WorkerState::Cooldown);
        tokio::time::sleep(Duration::from_secs_f64(cooldown.max(0.001))).await;
        self.cooldown_gate.send_replace(true);

        self.update_freeze(status_code, freeze_time, freeze_left);
        if *freeze_left > 0.0 {
            info!(account = %self.email, seconds = *freeze_left, "frozen");
            self.update_state(WorkerState::Frozen);
            let mut expired = false;
            while self.queue.is_empty() {
                tokio::time::sleep(FREEZE_SLICE).await;
                *freeze_left -= FREEZE_SLICE.as_secs_f64();
                if *freeze_left <= 0.0 {
                    *freeze_left = 0.0;
                    expired = true;
                    break;
                }
            }
            if !expired {
                debug!(account = %self.email, "unfrozen earlier");
            }
        }
    }

    /// Non-admin post-processing: usage, per-route stats and the
    /// adaptive routing-rule mutations.
    async fn apply_outcome(&self, task: &Arc<Task>, route: &str, status_code: Option<u16>) {
        let failed = task.error().is_some();
        {
            let mut acc = self.account.lock().unwrap();
            acc.inc_usage(&task.path);
            let stats = acc.req_stats.entry(route.to_string()).or_default();
            stats.inc("sent");
            stats.inc(if failed { "failed" } else { "succeed" });
            acc.last_status_codes.insert(route.to_string(), status_code);
            acc.last_req_timestamp = Some(Utc::now());
        }

        let status = status_code.unwrap_or(0);
        let is_banned_status =
            status_code.is_some_and(|s| self.config.banned_status_codes.contains(&s));
        let is_freeze_status =
            status_code.is_some_and(|s| self.config.freeze_status_codes.contains(&s));

        if is_banned_status {
            self.remove_bind_request(task).await;
            self.account
                .lock()
                .unwrap()
                .add_routing_rule(RuleKind::Deny, route, None, None);
            warn!(account = %self.email, status, route, "added forbidden route");
        } else if route != "*" && is_freeze_status {
            self.remove_bind_request(task).await;
            let response = task.result();
            let mut freeze_endpoint = route.to_string();
            let mut retry_after: Option<f64> = None;
            if let Some(header_name) = &self.config.retry_after_header {
                let hinted = response
                    .as_ref()
                    .and_then(|r| r.header(header_name))
                    .and_then(|value| value.parse::<f64>().ok());
                match hinted {
                    Some(seconds) => retry_after = Some(seconds),
                    None => {
                        // no usable hint: deny the longest non-digit
                        // prefix of the response path instead
                        if let Some(response) = &response {
                            if let Some(prefix) = pattern::match_prefix(
                                &self.config.retry_after_path_fallback_re,
                                &response.url_path,
                            ) {
                                if prefix.len() >= freeze_endpoint.len() {
                                    freeze_endpoint = prefix;
                                }
                            }
                            debug!(account = %self.email, path = %response.url_path, "retry-after hint unusable");
                        }
                    }
                }
            }
            if let Some(max_time) = self.config.retry_after_max_time {
                retry_after = Some(retry_after.map_or(max_time, |secs| secs.min(max_time)));
            }
            let expire = retry_after
                .map(|seconds| Instant::now() + Duration::from_secs_f64(seconds.max(0.0)));
            self.account.lock().unwrap().add_routing_rule(
                RuleKind::Deny,
                &freeze_endpoint,
                None,
                expire,
            );
            warn!(
                account = %self.email,
                status,
                route = %freeze_endpoint,
                retry_after = ?retry_after,
                "added forbidden route",
            );
        } else if self.account.lock().unwrap().limits_exceeded(&task.path) {
            self.account
                .lock()
                .unwrap()
                .add_routing_rule(RuleKind::Deny, route, None, None);
            warn!(account = %self.email, route, "added forbidden route (exceeded limits)");
        }
    }

    /// Evict the task's sticky-routing entry, if it carries one.
    async fn remove_bind_request(&self, task: &Task) -> bool {
        match task.bind_key() {
            Some(key) => {
                if let Err(err) = self.bind_cache.remove(&key).await {
                    warn!(account = %self.email, error = %err, "bind entry removal failed");
                }
                true
            }
            None => false,
        }
    }
}
