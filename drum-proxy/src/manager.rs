use crate::client::ApiTransport;
use crate::worker::Worker;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use drum_core::account::{AccountApiMode, SharedAccount};
use drum_core::{pattern, Account, Counter, RouterError, Task};
use drum_store::BindCache;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Builds the per-account transport at registration; the seam test
/// suites inject scripted upstreams through.
pub type TransportFactory =
    Box<dyn Fn(&Account) -> Result<Arc<dyn ApiTransport>, RouterError> + Send + Sync>;

/// Account registry and request scheduler.
///
/// Owns the accounts, their workers and the sticky-routing cache.
/// `add_task` pins every incoming task to exactly one worker: by
/// explicit account, by a live bind entry, or by a cost-ordered race
/// over the eligible pool.
pub struct Manager {
    accounts: DashMap<String, SharedAccount>,
    workers: DashMap<String, Arc<Worker>>,
    bind_cache: Arc<BindCache>,
    config: Arc<drum_core::RouterConfig>,
    transport_factory: TransportFactory,
    worker_waiting_time: Mutex<Counter>,
    task_type: Mutex<Counter>,
}

impl Manager {
    pub fn new(
        config: Arc<drum_core::RouterConfig>,
        bind_cache: Arc<BindCache>,
        transport_factory: TransportFactory,
    ) -> Self {
        Self {
            accounts: DashMap::new(),
            workers: DashMap::new(),
            bind_cache,
            config,
            transport_factory,
            worker_waiting_time: Mutex::new(Counter::new()),
            task_type: Mutex::new(Counter::new()),
        }
    }

    pub fn bind_cache(&self) -> Arc<BindCache> {
        Arc::clone(&self.bind_cache)
    }

    pub fn free_workers_available(&self) -> usize {
        self.workers
            .iter()
            .filter(|entry| entry.value().is_running())
            .count()
    }

    async fn remove_bind_request(&self, task: &Task) -> bool {
        match task.bind_key() {
            Some(key) => {
                let _ = self.bind_cache.remove(&key).await;
                true
            }
            None => false,
        }
    }

    fn census(&self, task: &Task, is_bind_request: bool) {
        let mut census = self.task_type.lock().unwrap();
        let origin = if task.admin { "admin" } else { "user" };
        if task.account().is_some() {
            census.inc(format!("{origin}:account"));
        } else if task.group != drum_core::task::DEFAULT_GROUP {
            census.inc(format!("{origin}:group"));
        } else {
            census.inc(origin);
        }
        if is_bind_request {
            census.inc("bind");
        }
    }

    /// Pin the task to a worker and enqueue it. The caller awaits
    /// `task.wait()` afterwards.
    pub async fn add_task(&self, task: Arc<Task>) -> Result<(), RouterError> {
        let donor = &self.config.donor;
        let maxsize = self.config.api.task_queue_maxsize;

        let is_bind_request = !task.admin
            && donor
                .bind_requests_path_re
                .iter()
                .any(|bp| pattern::matches(&bp.path, &task.path));
        self.census(&task, is_bind_request);
        if is_bind_request && task.account().is_none() {
            self.attach_bind_key(&task).await?;
        }

        let worker: Arc<Worker> = if let Some(email) = task.account() {
            // explicit account, or a bind-cache re-pin
            let Some(account) = self.accounts.get(&email).map(|a| Arc::clone(a.value())) else {
                self.remove_bind_request(&task).await;
                return Err(RouterError::Manager(format!("account not found: {email}")));
            };
            let uid = account.lock().unwrap().uid.clone();
            let worker = self
                .workers
                .get(&uid)
                .map(|w| Arc::clone(w.value()))
                .ok_or_else(|| RouterError::Manager(format!("account not found: {email}")))?;
            self.worker_waiting_time.lock().unwrap().inc("0");
            let qsize = worker.queue_len();
            if qsize >= maxsize {
                return Err(RouterError::Manager(format!(
                    "{email} queue exceeded maxsize: {qsize}"
                )));
            }
            worker
        } else if !task.admin {
            self.open_race(&task).await?
        } else {
            return Err(RouterError::Manager(
                "invalid `x-admin` request (no `x-account` specified)".into(),
            ));
        };

        {
            let account = worker.account();
            let acc = account.lock().unwrap();
            if acc.banned {
                return Err(RouterError::Manager(format!("{} is banned", acc.email)));
            }
            if !((worker.is_frozen() && task.admin) || worker.is_running()) {
                return Err(RouterError::Manager(format!(
                    "{} is {:?}",
                    acc.email,
                    worker.state()
                )));
            }
        }

        if is_bind_request {
            if let Some(bind_key) = task.bind_key() {
                debug!(account = %worker.email(), task = %task, "bind request");
                self.bind_cache.set(&bind_key, worker.email()).await?;
            }
        }

        task.schedule();
        worker.enqueue(Arc::clone(&task));
        debug!(task = %task, "task is scheduled");
        let qsize = worker.queue_len();
        if qsize > self.config.api.queue_size_warning_threshold {
            warn!(account = %worker.email(), qsize, "queue size");
        } else {
            debug!(account = %worker.email(), qsize, "queue size");
        }
        Ok(())
    }

    /// Compute and attach the sticky-routing key, and re-pin the task
    /// when a live bind entry already names an account.
    async fn attach_bind_key(&self, task: &Task) -> Result<(), RouterError> {
        for bind_pattern in &self.config.donor.bind_requests_path_re {
            let Some(matched_path) = pattern::match_prefix(&bind_pattern.path, &task.path) else {
                continue;
            };
            let mut params: Vec<(&String, &String)> = task
                .query_map
                .iter()
                .filter(|(name, _)| bind_pattern.params.contains(name))
                .collect();
            if !params.is_empty() {
                params.sort_by(|a, b| a.0.cmp(b.0));
                let joined = params
                    .iter()
                    .map(|(name, value)| format!("{name}:{value}"))
                    .collect::<Vec<_>>()
                    .join("|");
                let bind_key = format!("bind|{matched_path}|{joined}");
                task.set_bind_key(&bind_key);
                if let Some(email) = self.bind_cache.get(&bind_key).await? {
                    // repeat lookups are free for the pinned account:
                    // jump the queue
                    task.set_account(&email);
                    task.set_priority(drum_core::task::TOP_PRIORITY);
                }
            }
            break;
        }
        Ok(())
    }

    /// Race the eligible workers for the task: cheapest cost first,
    /// longest idle first, fewest bind entries first; first worker to
    /// signal free wins, bounded by `workers_timeout`.
    async fn open_race(&self, task: &Task) -> Result<Arc<Worker>, RouterError> {
        let maxsize = self.config.api.task_queue_maxsize;
        let mut candidates: Vec<(u32, Option<DateTime<Utc>>, String, Arc<Worker>)> = Vec::new();
        for entry in self.workers.iter() {
            let worker = entry.value();
            let account = worker.account();
            let mut acc = account.lock().unwrap();
            if acc.api_mode == AccountApiMode::Drum
                && acc.group == task.group
                && worker.is_running()
                && worker.queue_len() < maxsize
                && acc.get_route(&task.path).is_some()
                && !acc.limits_exceeded(&task.path)
            {
                candidates.push((
                    acc.cost,
                    acc.last_req_timestamp,
                    acc.email.clone(),
                    Arc::clone(worker),
                ));
            }
        }

        if candidates.is_empty() {
            self.worker_waiting_time.lock().unwrap().inc("-1");
            warn!(task = %task, "no workers available");
            return Err(RouterError::Manager("no workers available".into()));
        }

        let mut ranked = Vec::with_capacity(candidates.len());
        for (cost, last_req, email, worker) in candidates {
            let bindings = self.bind_cache.count_keys_for_value(&email).await.unwrap_or(0);
            ranked.push((cost, last_req.unwrap_or(DateTime::<Utc>::MIN_UTC), bindings, worker));
        }
        ranked.sort_by(|a, b| (a.0, a.1, a.2).cmp(&(b.0, b.1, b.2)));

        // a worker already advertising free wins outright, in rank order
        if let Some((_, _, _, worker)) = ranked.iter().find(|(_, _, _, w)| w.is_free()) {
            self.worker_waiting_time.lock().unwrap().inc("1");
            return Ok(Arc::clone(worker));
        }

        let since = Instant::now();
        let (winner_tx, mut winner_rx) = tokio::sync::mpsc::channel::<usize>(ranked.len());
        let waiters: Vec<_> = ranked
            .iter()
            .enumerate()
            .map(|(index, (_, _, _, worker))| {
                let worker = Arc::clone(worker);
                let winner_tx = winner_tx.clone();
                tokio::spawn(async move {
                    worker.wait_free().await;
                    let _ = winner_tx.send(index).await;
                })
            })
            .collect();
        drop(winner_tx);

        let timeout = Duration::from_secs_f64(self.config.api.workers_timeout);
        let winner = tokio::time::timeout(timeout, winner_rx.recv()).await;
        for waiter in &waiters {
            waiter.abort();
        }

        match winner {
            Ok(Some(index)) => {
                let time_spent = since.elapsed().as_secs_f64();
                self.worker_waiting_time
                    .lock()
                    .unwrap()
                    .inc((time_spent as u64 + 1).to_string());
                debug!(seconds = time_spent, "free worker was found");
                Ok(Arc::clone(&ranked[index].3))
            }
            _ => {
                self.worker_waiting_time.lock().unwrap().inc("-1");
                warn!(task = %task, "no free worker available");
                Err(RouterError::Manager("no free worker available".into()))
            }
        }
    }

    // ── Registry ──────────────────────────────────────────────

    pub fn add_account(&self, account: Account) -> Result<(), RouterError> {
        account.validate()?;
        if self.accounts.contains_key(&account.email) {
            return Err(RouterError::Manager(format!(
                "account is already registered: {}",
                account.email
            )));
        }
        let mut account = account;
        let donor = &self.config.donor;
        if account.quota.limits.is_empty() && !donor.api_daily_limits_per_account.is_empty() {
            account.quota.limits = donor.api_daily_limits_per_account.clone();
        }
        if account.api_routing_rules.is_empty() && !donor.api_default_routing_rules.is_empty() {
            account.api_routing_rules = donor.api_default_routing_rules.clone();
        }
        account.snapshot_routing_rules();

        let transport = (self.transport_factory)(&account)?;
        let email = account.email.clone();
        let shared: SharedAccount = Arc::new(Mutex::new(account));
        self.accounts.insert(email.clone(), Arc::clone(&shared));

        let worker = Worker::new(
            shared,
            transport,
            Arc::clone(&self.bind_cache),
            Arc::new(self.config.donor.clone()),
        );
        self.workers.insert(worker.uid().to_string(), Arc::clone(&worker));
        worker.start();
        info!(account = %email, "account is registered");
        Ok(())
    }

    /// A point-in-time copy of the account, expired rules purged.
    pub fn get_account(&self, email: &str) -> Result<Account, RouterError> {
        let account = self
            .accounts
            .get(email)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| RouterError::Manager(format!("account not found: {email}")))?;
        let mut acc = account.lock().unwrap();
        acc.refresh_routing_rules();
        Ok(acc.clone())
    }

    pub fn get_all_accounts(&self) -> Vec<Account> {
        let emails: Vec<String> = self.accounts.iter().map(|a| a.key().clone()).collect();
        emails
            .iter()
            .filter_map(|email| self.get_account(email).ok())
            .collect()
    }

    pub fn remove_account(&self, email: &str) -> Result<(), RouterError> {
        let (_, account) = self
            .accounts
            .remove(email)
            .ok_or_else(|| RouterError::Manager(format!("account not found: {email}")))?;
        let uid = account.lock().unwrap().uid.clone();
        if let Some((_, worker)) = self.workers.remove(&uid) {
            worker.stop();
        }
        info!(account = %email, "account is removed");
        Ok(())
    }

    pub fn remove_all_accounts(&self) {
        let emails: Vec<String> = self.accounts.iter().map(|a| a.key().clone()).collect();
        for email in emails {
            let _ = self.remove_account(&email);
        }
    }

    pub fn reset_account(&self, email: &str) -> Result<(), RouterError> {
        let account = self
            .accounts
            .get(email)
            .map(|a| Arc::clone(a.value()))
            .ok_or_else(|| RouterError::Manager(format!("account not found: {email}")))?;
        account.lock().unwrap().reset();
        Ok(())
    }

    pub fn reset_all_accounts(&self) {
        let emails: Vec<String> = self.accounts.iter().map(|a| a.key().clone()).collect();
        for email in emails {
            let _ = self.reset_account(&email);
        }
    }

    // ── Service statistics ────────────────────────────────────

    pub fn worker_waiting_time(&self) -> Counter {
        self.worker_waiting_time.lock().unwrap().clone()
    }

    pub fn task_type(&self) -> Counter {
        self.task_type.lock().unwrap().clone()
    }

    pub fn clear_service_stats(&self) {
        self.worker_waiting_time.lock().unwrap().clear();
        self.task_type.lock().unwrap().clear();
    }
}
