pub mod bind_cache;
pub mod kv;
pub mod response_cache;
pub mod signature;

#[cfg(feature = "redis")]
pub mod redis;

pub use bind_cache::BindCache;
pub use kv::{KvStore, MemoryStore};
pub use response_cache::{CachedResponse, ResponseCache};
