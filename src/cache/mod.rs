//! Fast-lookup cache sink
//!
//! Every persisted reading is also written to a key-value cache under
//! `source:<unix seconds>` with an expiry. The cache is a secondary sink:
//! losing it never blocks the pipeline.
//!
//! ## Backends
//!
//! - **Redis** (`cache-redis` feature): `SET key value EX ttl`
//! - **In-Memory**: same expiry semantics, checked on read

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod memory;
#[cfg(feature = "cache-redis")]
pub mod redis;

pub use memory::MemoryCache;

/// Result type alias for cache operations
pub type CacheResult<T> = Result<T, CacheError>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("failed to connect to cache: {0}")]
    ConnectionFailed(String),

    #[error("cache command failed: {0}")]
    CommandFailed(String),

    #[error("cache unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait CacheBackend: Send + Sync {
    /// Store a value that expires after `ttl`
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> CacheResult<()>;

    /// Read a value; expired or missing keys yield `None`
    async fn get(&self, key: &str) -> CacheResult<Option<i64>>;

    /// Human-readable backend name for logs and stats
    fn describe(&self) -> String;
}

/// Cache key of one observation
pub fn cache_key(source: &str, observed_at: DateTime<Utc>) -> String {
    format!("{source}:{}", observed_at.timestamp())
}
