//! Persistence of consumed batches to the durable store and the cache
//!
//! Readings are written in batch order, each to the store first and then to
//! the cache. A failing sink is logged and counted; it never stops the other
//! sink or the remaining readings.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, instrument};

use crate::Batch;
use crate::cache::{CacheBackend, cache_key};
use crate::storage::schema::observation_time;
use crate::storage::{PersistedMetric, StorageBackend};

/// Outcome of persisting one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PersistReport {
    /// New records written to the store
    pub stored: usize,

    /// Readings the store already held
    pub duplicates: usize,

    pub cached: usize,
    pub store_failures: usize,
    pub cache_failures: usize,
}

impl PersistReport {
    pub fn is_clean(&self) -> bool {
        self.store_failures == 0 && self.cache_failures == 0
    }
}

pub struct Sinks {
    store: Arc<dyn StorageBackend>,
    cache: Arc<dyn CacheBackend>,
    ttl: Duration,

    /// Pause after each reading; zero disables it
    persist_delay: Duration,
}

impl Sinks {
    pub fn new(store: Arc<dyn StorageBackend>, cache: Arc<dyn CacheBackend>, ttl: Duration) -> Self {
        Self {
            store,
            cache,
            ttl,
            persist_delay: Duration::ZERO,
        }
    }

    pub fn with_persist_delay(mut self, delay: Duration) -> Self {
        self.persist_delay = delay;
        self
    }

    pub fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    /// Write every reading of a batch to both sinks
    ///
    /// All readings of one batch share a single `observed_at`.
    #[instrument(skip_all, fields(readings = batch.len()))]
    pub async fn persist_batch(&self, batch: &Batch) -> PersistReport {
        let observed_at = observation_time();
        let mut report = PersistReport::default();

        for reading in batch.readings() {
            let metric = PersistedMetric::from_reading(reading, observed_at);

            match self.store.insert_metric(&metric).await {
                Ok(true) => report.stored += 1,
                Ok(false) => report.duplicates += 1,
                Err(e) => {
                    error!("failed to store reading from {}: {e}", reading.source);
                    report.store_failures += 1;
                }
            }

            let key = cache_key(&reading.source, observed_at);
            match self.cache.set(&key, reading.value, self.ttl).await {
                Ok(()) => report.cached += 1,
                Err(e) => {
                    error!("failed to cache {key} in {}: {e}", self.cache.describe());
                    report.cache_failures += 1;
                }
            }

            if !self.persist_delay.is_zero() {
                tokio::time::sleep(self.persist_delay).await;
            }
        }

        debug!(?report, "batch persisted");
        report
    }
}
