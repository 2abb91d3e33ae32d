use crate::kv::KvStore;
use async_trait::async_trait;
use drum_core::RouterError;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::info;

fn store_err(err: redis::RedisError) -> RouterError {
    RouterError::Store(err.to_string())
}

/// Redis-backed store shared between router instances.
pub struct RedisStore {
    conn: ConnectionManager,
}

impl RedisStore {
    pub async fn connect(host: &str, port: u16, db: i64) -> Result<Self, RouterError> {
        let url = format!("redis://{host}:{port}/{db}");
        let client = redis::Client::open(url.as_str()).map_err(store_err)?;
        let conn = ConnectionManager::new(client).await.map_err(store_err)?;
        info!(url, "connected to redis store");
        Ok(Self { conn })
    }
}

#[async_trait]
impl KvStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, RouterError> {
        let mut conn = self.conn.clone();
        conn.get(key).await.map_err(store_err)
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        match ttl {
            Some(ttl) => conn
                .set_ex(key, value, ttl.as_secs().max(1))
                .await
                .map_err(store_err),
            None => conn.set(key, value).await.map_err(store_err),
        }
    }

    async fn remove(&self, key: &str) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        conn.del(key).await.map_err(store_err)
    }

    async fn purge(&self) -> Result<(), RouterError> {
        let mut conn = self.conn.clone();
        let _: () = redis::cmd("FLUSHDB")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, RouterError> {
        let mut conn = self.conn.clone();
        let size: usize = redis::cmd("DBSIZE")
            .query_async(&mut conn)
            .await
            .map_err(store_err)?;
        Ok(size)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<String>, RouterError> {
        let mut conn = self.conn.clone();
        let mut iter = conn
            .scan_match::<_, String>(format!("{prefix}*"))
            .await
            .map_err(store_err)?;
        let mut keys = Vec::new();
        while let Some(key) = iter.next_item().await {
            keys.push(key);
        }
        Ok(keys)
    }

    async fn mget(&self, keys: &[String]) -> Result<Vec<Option<Vec<u8>>>, RouterError> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        conn.mget(keys).await.map_err(store_err)
    }
}
