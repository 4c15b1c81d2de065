//! Redis cache backend
//!
//! Uses a `ConnectionManager`, which reconnects on its own after the server
//! goes away; a command issued while disconnected fails and is reported to the
//! caller like any other cache failure.

use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use tracing::{info, instrument};

use super::{CacheBackend, CacheError, CacheResult};

pub struct RedisCache {
    manager: ConnectionManager,
    url: String,
}

impl RedisCache {
    #[instrument(skip_all, fields(url = %url))]
    pub async fn connect(url: &str) -> CacheResult<Self> {
        let client =
            redis::Client::open(url).map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;

        let manager = ConnectionManager::new(client)
            .await
            .map_err(|e| CacheError::ConnectionFailed(e.to_string()))?;

        info!("connected to redis");

        Ok(Self {
            manager,
            url: url.to_string(),
        })
    }
}

#[async_trait]
impl CacheBackend for RedisCache {
    async fn set(&self, key: &str, value: i64, ttl: Duration) -> CacheResult<()> {
        let mut conn = self.manager.clone();
        conn.set_ex::<_, _, ()>(key, value, ttl.as_secs().max(1))
            .await
            .map_err(|e| CacheError::CommandFailed(e.to_string()))
    }

    async fn get(&self, key: &str) -> CacheResult<Option<i64>> {
        let mut conn = self.manager.clone();
        conn.get(key)
            .await
            .map_err(|e| CacheError::CommandFailed(e.to_string()))
    }

    fn describe(&self) -> String {
        format!("redis ({})", self.url)
    }
}
