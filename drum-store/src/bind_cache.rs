use crate::kv::KvStore;
use drum_core::RouterError;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Prefix reserved for sticky-routing entries.
pub const BIND_PREFIX: &str = "bind|";

/// How long one key scan is reused by `count_keys_for_value`.
const SCAN_MEMO_TTL: Duration = Duration::from_secs(2);

/// Sticky-routing table: bind key → account email.
///
/// Lives in the same shared store as the response cache, under its own
/// prefix, so repeated equivalent requests keep landing on the account
/// that already served them while the entry is alive.
pub struct BindCache {
    store: Arc<dyn KvStore>,
    ttl: f64,
    scan_memo: Mutex<Option<(Instant, Vec<String>)>>,
}

impl BindCache {
    pub fn new(store: Arc<dyn KvStore>, ttl: f64) -> Self {
        Self {
            store,
            ttl,
            scan_memo: Mutex::new(None),
        }
    }

    pub async fn get(&self, key: &str) -> Result<Option<String>, RouterError> {
        Ok(self
            .store
            .get(key)
            .await?
            .map(|value| String::from_utf8_lossy(&value).into_owned()))
    }

    pub async fn set(&self, key: &str, email: &str) -> Result<(), RouterError> {
        self.store
            .set(
                key,
                email.as_bytes().to_vec(),
                Some(Duration::from_secs_f64(self.ttl)),
            )
            .await
    }

    pub async fn remove(&self, key: &str) -> Result<(), RouterError> {
        self.store.remove(key).await
    }

    /// Live bind entries pointing at the account: the scheduler's
    /// final tiebreaker. The key scan is O(bind entries), so one scan
    /// is memoized for a short while to bound scheduling latency.
    pub async fn count_keys_for_value(&self, email: &str) -> Result<usize, RouterError> {
        let memoized = {
            let memo = self.scan_memo.lock().unwrap();
            memo.as_ref()
                .filter(|(at, _)| at.elapsed() < SCAN_MEMO_TTL)
                .map(|(_, keys)| keys.clone())
        };
        let keys = match memoized {
            Some(keys) => keys,
            None => {
                let keys = self.store.scan_prefix(BIND_PREFIX).await?;
                *self.scan_memo.lock().unwrap() = Some((Instant::now(), keys.clone()));
                keys
            }
        };
        if keys.is_empty() {
            return Ok(0);
        }
        let values = self.store.mget(&keys).await?;
        Ok(values
            .iter()
            .flatten()
            .filter(|value| value.as_slice() == email.as_bytes())
            .count())
    }
}
