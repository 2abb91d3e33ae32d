use async_trait::async_trait;
use drum_core::RouterError;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// The shared key/value store both caches live in.
///
/// The store persists outside the router process (Redis in
/// production), so several router instances may share one; the
/// in-memory backend covers tests and single-node deployments.
/// Key prefixes are reserved per cache: `"k:"` for responses,
/// `"bind|"` for sticky-routing entries.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RouterError>;

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), RouterError>;

    async fn remove(&self, key: &str) -> Result<(), RouterError>;

    /// Drop every key.
    async fn purge(&self) -> Result<(), RouterError>;

    async fn len(&self) -> Result<usize, RouterError>;

    /// Keys starting with `prefix`, unordered.
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RouterError>;

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RouterError>;
}

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|deadline| deadline < now)
    }
}

/// In-process store backend.
#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn sweep(entries: &mut HashMap<String, Entry>) {
        let now = Instant::now();
        entries.retain(|_, entry| !entry.expired(now));
    }
}

#[async_trait]
impl KvStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RouterError> {
        let mut entries = self.entries.lock().unwrap();
        let expired = entries.get(key).is_some_and(|e| e.expired(Instant::now()));
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|e| e.value.clone()))
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), RouterError> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), RouterError> {
        self.entries.lock().unwrap().remove(key);
        Ok(())
    }

    async fn purge(&self) -> Result<(), RouterError> {
        self.entries.lock().unwrap().clear();
        Ok(())
    }

    async fn len(&self) -> Result<usize, RouterError> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        Ok(entries.len())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RouterError> {
        let mut entries = self.entries.lock().unwrap();
        Self::sweep(&mut entries);
        Ok(entries
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RouterError> {
        let entries = self.entries.lock().unwrap();
        let now = Instant::now();
        Ok(keys
            .iter()
            .map(|key| {
                entries
                    .get(key)
                    .filter(|entry| !entry.expired(now))
                    .map(|entry| entry.value.clone())
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_get_remove() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec(), None).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"1".to_vec()));
        store.remove("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }

    #[tokio::test]
    async fn ttl_expires_entries() {
        let store = MemoryStore::new();
        store
            .set("a", b"1".to_vec(), Some(Duration::from_millis(20)))
            .await
            .unwrap();
        assert!(store.get("a").await.unwrap().is_some());
        tokio::time::sleep(Duration::from_millis(40)).await;
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.len().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn scan_prefix_filters_keys() {
        let store = MemoryStore::new();
        store.set("bind|a", b"x".to_vec(), None).await.unwrap();
        store.set("bind|b", b"y".to_vec(), None).await.unwrap();
        store.set("k:1", b"z".to_vec(), None).await.unwrap();
        let mut keys = store.scan_prefix("bind|").await.unwrap();
        keys.sort();
        assert_eq!(keys, vec!["bind|a".to_string(), "bind|b".to_string()]);
    }

    #[tokio::test]
    async fn mget_returns_aligned_values() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec(), None).await.unwrap();
        let values = store
            .mget(&["a".to_string(), "missing".to_string()])
            .await
            .unwrap();
        assert_eq!(values, vec![Some(b"1".to_vec()), None]);
    }

    #[tokio::test]
    async fn purge_clears_everything() {
        let store = MemoryStore::new();
        store.set("a", b"1".to_vec(), None).await.unwrap();
        store.purge().await.unwrap();
        assert_eq!(store.len().await.unwrap(), 0);
    }
}
