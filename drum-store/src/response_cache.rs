use crate::kv::KvStore;
use crate::signature::{
    self, decode_request_signature, encode_request_signature, KEY_PREFIX,
};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use dashmap::DashMap;
use drum_core::{Counter, RouterError};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Serialized cache payload: a self-describing `(status, headers,
/// body)` triple that round-trips exactly and survives router
/// upgrades.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CachedResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    #[serde(with = "body_b64")]
    pub body: Vec<u8>,
}

mod body_b64 {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        BASE64.decode(text).map_err(serde::de::Error::custom)
    }
}

impl CachedResponse {
    pub fn to_bytes(&self) -> Result<Vec<u8>, RouterError> {
        serde_json::to_vec(self).map_err(|e| RouterError::Store(e.to_string()))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, RouterError> {
        serde_json::from_slice(data).map_err(|e| RouterError::Store(e.to_string()))
    }
}

/// One row of the popularity listing.
#[derive(Debug, Clone, Serialize)]
pub struct PopularRequest {
    pub key: String,
    pub lookups: u64,
    /// Distinct logins that looked the key up.
    pub users: usize,
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub params: String,
}

struct CacheCounters {
    lookups: Counter,
    hits: Counter,
    misses: Counter,
}

/// Hash-keyed, TTL-bounded cache of upstream responses.
///
/// Lives in the shared store under the `"k:"` prefix. Tracks per-key
/// lookup statistics and keeps the signature preimages around for the
/// popularity endpoint. Insertion order bounds the entry count:
/// oldest-inserted entries are dropped once `maxsize` is exceeded.
pub struct ResponseCache {
    store: Arc<dyn KvStore>,
    maxsize: Option<usize>,
    default_ttl: Option<f64>,
    order: Mutex<VecDeque<String>>,
    counters: Mutex<CacheCounters>,
    req_signatures: DashMap<String, Vec<u8>>,
    lookup_users: DashMap<String, HashSet<String>>,
}

impl ResponseCache {
    pub fn new(store: Arc<dyn KvStore>, maxsize: Option<usize>, default_ttl: Option<f64>) -> Self {
        Self {
            store,
            maxsize,
            default_ttl,
            order: Mutex::new(VecDeque::new()),
            counters: Mutex::new(CacheCounters {
                lookups: Counter::new(),
                hits: Counter::new(),
                misses: Counter::new(),
            }),
            req_signatures: DashMap::new(),
            lookup_users: DashMap::new(),
        }
    }

    /// Derive the cache key for a request and remember its preimage.
    pub fn make_request_key(
        &self,
        method: &str,
        path: &str,
        headers: &HashMap<String, String>,
        query: &str,
        body: &[u8],
    ) -> String {
        let sig = encode_request_signature(method, path, headers, query, body);
        let key = signature::make_key(&sig);
        self.req_signatures.insert(key.clone(), sig);
        key
    }

    /// Record which login asked for a key (popularity statistics).
    pub fn note_lookup_user(&self, key: &str, login: &str) {
        self.lookup_users
            .entry(key.to_string())
            .or_default()
            .insert(login.to_string());
    }

    pub fn clear_lookup_users(&self) {
        self.lookup_users.clear();
    }

    /// Fetch a serialized response. `count: false` suppresses the
    /// statistics for existence probes.
    pub async fn get(&self, key: &str, count: bool) -> Result<Option<Vec<u8>>, RouterError> {
        let value = self.store.get(key).await?;
        if count {
            let mut counters = self.counters.lock().unwrap();
            counters.lookups.inc(key);
            match value {
                Some(_) => counters.hits.inc(key),
                None => counters.misses.inc(key),
            }
        }
        Ok(value)
    }

    /// Insert with the given TTL (falling back to the default one) and
    /// enforce the entry bound by dropping oldest-inserted keys.
    pub async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<f64>,
    ) -> Result<(), RouterError> {
        let ttl = ttl.or(self.default_ttl).map(Duration::from_secs_f64);
        self.store.set(key, value, ttl).await?;

        let evicted: Vec<String> = {
            let mut order = self.order.lock().unwrap();
            order.retain(|existing| existing != key);
            order.push_back(key.to_string());
            let mut evicted = Vec::new();
            if let Some(maxsize) = self.maxsize {
                while order.len() > maxsize {
                    if let Some(victim) = order.pop_front() {
                        evicted.push(victim);
                    }
                }
            }
            evicted
        };
        for victim in evicted {
            self.store.remove(&victim).await?;
        }
        Ok(())
    }

    pub async fn remove(&self, key: &str) -> Result<(), RouterError> {
        self.order.lock().unwrap().retain(|existing| existing != key);
        self.store.remove(key).await
    }

    /// Drop every cached response and reset the statistics. Entries
    /// of other prefixes sharing the store are left alone.
    pub async fn purge(&self) -> Result<(), RouterError> {
        {
            let mut counters = self.counters.lock().unwrap();
            counters.lookups.clear();
            counters.hits.clear();
            counters.misses.clear();
        }
        self.req_signatures.clear();
        self.order.lock().unwrap().clear();
        for key in self.store.scan_prefix(KEY_PREFIX).await? {
            self.store.remove(&key).await?;
        }
        Ok(())
    }

    pub async fn size(&self) -> Result<usize, RouterError> {
        Ok(self.store.scan_prefix(KEY_PREFIX).await?.len())
    }

    pub async fn capacity(&self) -> Result<Option<usize>, RouterError> {
        match self.maxsize {
            Some(maxsize) => Ok(Some(maxsize.saturating_sub(self.size().await?))),
            None => Ok(None),
        }
    }

    pub fn lookups(&self) -> u64 {
        self.counters.lock().unwrap().lookups.total()
    }

    pub fn hits(&self) -> u64 {
        self.counters.lock().unwrap().hits.total()
    }

    pub fn misses(&self) -> u64 {
        self.counters.lock().unwrap().misses.total()
    }

    pub fn hitrate(&self) -> f64 {
        let (hits, misses) = (self.hits() as f64, self.misses() as f64);
        if hits + misses > 0.0 {
            hits / (hits + misses)
        } else {
            0.0
        }
    }

    pub fn misses_for(&self, key: &str) -> u64 {
        self.counters.lock().unwrap().misses.get(key)
    }

    /// Every looked-up request whose preimage is still known, most
    /// looked-up first.
    pub fn most_common_requests(&self, n: Option<usize>) -> Vec<PopularRequest> {
        let ranked = self.counters.lock().unwrap().lookups.most_common(n);
        ranked
            .into_iter()
            .filter_map(|(key, lookups)| {
                let sig = self.req_signatures.get(&key)?;
                let decoded = decode_request_signature(sig.value()).ok()?;
                let users = self
                    .lookup_users
                    .get(&key)
                    .map(|logins| logins.len())
                    .unwrap_or(0);
                Some(PopularRequest {
                    key: key.clone(),
                    lookups,
                    users,
                    method: decoded.method,
                    path: decoded.path,
                    headers: decoded.headers,
                    params: decoded.params,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::MemoryStore;

    fn cache(maxsize: Option<usize>, ttl: Option<f64>) -> ResponseCache {
        ResponseCache::new(Arc::new(MemoryStore::new()), maxsize, ttl)
    }

    #[tokio::test]
    async fn hit_and_miss_counting() {
        let cache = cache(None, None);
        assert_eq!(cache.get("k:1", true).await.unwrap(), None);
        cache.set("k:1", b"v".to_vec(), None).await.unwrap();
        assert_eq!(cache.get("k:1", true).await.unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.lookups(), 2);
        assert_eq!(cache.hits(), 1);
        assert_eq!(cache.misses(), 1);
        assert_eq!(cache.hitrate(), 0.5);
    }

    #[tokio::test]
    async fn uncounted_probe_leaves_stats_alone() {
        let cache = cache(None, None);
        assert_eq!(cache.get("k:1", false).await.unwrap(), None);
        assert_eq!(cache.lookups(), 0);
        assert_eq!(cache.hitrate(), 0.0);
    }

    #[tokio::test]
    async fn ttl_expiry_becomes_a_miss() {
        let cache = cache(None, None);
        cache.set("k:1", b"v".to_vec(), Some(0.02)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(cache.get("k:1", true).await.unwrap(), None);
        assert_eq!(cache.misses_for("k:1"), 1);
    }

    #[tokio::test]
    async fn oldest_inserted_is_evicted_at_capacity() {
        let cache = cache(Some(2), None);
        cache.set("k:1", b"1".to_vec(), None).await.unwrap();
        cache.set("k:2", b"2".to_vec(), None).await.unwrap();
        cache.set("k:3", b"3".to_vec(), None).await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 2);
        assert_eq!(cache.get("k:1", false).await.unwrap(), None);
        assert!(cache.get("k:3", false).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn reinserting_a_key_does_not_evict_it() {
        let cache = cache(Some(2), None);
        cache.set("k:1", b"1".to_vec(), None).await.unwrap();
        cache.set("k:2", b"2".to_vec(), None).await.unwrap();
        cache.set("k:1", b"1b".to_vec(), None).await.unwrap();
        cache.set("k:3", b"3".to_vec(), None).await.unwrap();
        // k:2 was the oldest insertion once k:1 was refreshed
        assert_eq!(cache.get("k:2", false).await.unwrap(), None);
        assert_eq!(cache.get("k:1", false).await.unwrap(), Some(b"1b".to_vec()));
    }

    #[tokio::test]
    async fn purge_resets_stats_and_spares_bind_keys() {
        let store = Arc::new(MemoryStore::new());
        let cache = ResponseCache::new(store.clone(), None, None);
        store
            .set("bind|x", b"acc@x".to_vec(), None)
            .await
            .unwrap();
        cache.set("k:1", b"v".to_vec(), None).await.unwrap();
        cache.get("k:1", true).await.unwrap();
        cache.purge().await.unwrap();
        assert_eq!(cache.size().await.unwrap(), 0);
        assert_eq!(cache.lookups(), 0);
        assert_eq!(store.get("bind|x").await.unwrap(), Some(b"acc@x".to_vec()));
    }

    #[tokio::test]
    async fn popularity_listing_ranks_by_lookups() {
        let cache = cache(None, None);
        let hot = cache.make_request_key("GET", "/api/wb/hot", &HashMap::new(), "d1=1", b"");
        let cold = cache.make_request_key("GET", "/api/wb/cold", &HashMap::new(), "", b"");
        for _ in 0..3 {
            cache.get(&hot, true).await.unwrap();
        }
        cache.get(&cold, true).await.unwrap();
        cache.note_lookup_user(&hot, "alice");
        cache.note_lookup_user(&hot, "bob");

        let popular = cache.most_common_requests(None);
        assert_eq!(popular[0].path, "/api/wb/hot");
        assert_eq!(popular[0].lookups, 3);
        assert_eq!(popular[0].users, 2);
        assert_eq!(popular[1].path, "/api/wb/cold");
    }

    #[test]
    fn cached_response_roundtrip() {
        let original = CachedResponse {
            status: 200,
            headers: vec![("content-type".into(), "application/json".into())],
            body: vec![0, 159, 146, 150], // not valid utf-8
        };
        let bytes = original.to_bytes().unwrap();
        assert_eq!(CachedResponse::from_bytes(&bytes).unwrap(), original);
    }
}
