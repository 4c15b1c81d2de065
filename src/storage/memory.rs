//! In-memory storage backend (no persistence)
//!
//! This backend keeps metrics in ordered maps behind a lock.
//! It's useful for:
//! - Testing without database dependencies
//! - Running the consumer with `backend = "none"`
//!
//! ## Limitations
//!
//! - **No persistence**: All data lost on restart
//! - **Unbounded**: Nothing is evicted

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use super::backend::{HealthStatus, QueryRange, StorageBackend, StoreStats};
use super::error::{StorageError, StorageResult};
use super::schema::PersistedMetric;

/// In-memory storage backend
#[derive(Default)]
pub struct MemoryBackend {
    /// Values keyed by source, then observation time
    metrics: RwLock<HashMap<String, BTreeMap<DateTime<Utc>, i64>>>,

    /// Simulated outage: writes fail while set
    failing: AtomicBool,

    closed: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail (or succeed again)
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.metrics.read().await.values().map(BTreeMap::len).sum()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("backend closed".to_string()));
        }
        if self.failing.load(Ordering::SeqCst) {
            return Err(StorageError::Unavailable("simulated outage".to_string()));
        }
        Ok(())
    }
}

fn to_metric(source: &str, observed_at: &DateTime<Utc>, value: &i64) -> PersistedMetric {
    PersistedMetric {
        source: source.to_string(),
        value: *value,
        observed_at: *observed_at,
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    async fn insert_metric(&self, metric: &PersistedMetric) -> StorageResult<bool> {
        self.check_writable()?;

        let mut metrics = self.metrics.write().await;
        let series = metrics.entry(metric.source.clone()).or_default();

        if series.contains_key(&metric.observed_at) {
            debug!("metric {}@{} already stored", metric.source, metric.observed_at);
            return Ok(false);
        }

        series.insert(metric.observed_at, metric.value);
        Ok(true)
    }

    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<PersistedMetric>> {
        debug!("querying in-memory storage for {}", query.source);

        if query.start > query.end {
            return Ok(vec![]);
        }

        let metrics = self.metrics.read().await;
        let Some(series) = metrics.get(&query.source) else {
            return Ok(vec![]);
        };

        Ok(series
            .range(query.start..=query.end)
            .take(query.limit.unwrap_or(usize::MAX))
            .map(|(at, value)| to_metric(&query.source, at, value))
            .collect())
    }

    async fn query_latest(
        &self,
        source: &str,
        limit: usize,
    ) -> StorageResult<Vec<PersistedMetric>> {
        let metrics = self.metrics.read().await;
        let Some(series) = metrics.get(source) else {
            return Ok(vec![]);
        };

        let mut latest: Vec<_> = series
            .iter()
            .rev()
            .take(limit)
            .map(|(at, value)| to_metric(source, at, value))
            .collect();
        latest.reverse();

        Ok(latest)
    }

    async fn query_recent(&self, limit: usize) -> StorageResult<Vec<PersistedMetric>> {
        let metrics = self.metrics.read().await;

        let mut all: Vec<_> = metrics
            .iter()
            .flat_map(|(source, series)| {
                series.iter().map(move |(at, value)| to_metric(source, at, value))
            })
            .collect();

        all.sort_by(|a, b| {
            a.observed_at
                .cmp(&b.observed_at)
                .then_with(|| a.source.cmp(&b.source))
        });

        let skip = all.len().saturating_sub(limit);
        Ok(all.split_off(skip))
    }

    async fn list_sources(&self) -> StorageResult<Vec<String>> {
        let mut sources: Vec<_> = self.metrics.read().await.keys().cloned().collect();
        sources.sort();
        Ok(sources)
    }

    async fn health_check(&self) -> StorageResult<HealthStatus> {
        let healthy = self.check_writable().is_ok();

        Ok(HealthStatus {
            healthy,
            message: if healthy {
                "In-memory storage operational".to_string()
            } else {
                "In-memory storage unavailable".to_string()
            },
            metadata: HashMap::from([
                ("backend".to_string(), "memory".to_string()),
                ("total_metrics".to_string(), self.len().await.to_string()),
            ]),
        })
    }

    async fn get_stats(&self) -> StorageResult<StoreStats> {
        let metrics = self.metrics.read().await;

        let oldest = metrics
            .values()
            .filter_map(|series| series.keys().next())
            .min()
            .copied();
        let newest = metrics
            .values()
            .filter_map(|series| series.keys().next_back())
            .max()
            .copied();

        Ok(StoreStats {
            backend: "memory".to_string(),
            total_metrics: metrics.values().map(|s| s.len() as u64).sum(),
            sources: metrics.len() as u64,
            oldest,
            newest,
        })
    }

    async fn close(&self) -> StorageResult<()> {
        debug!("closing in-memory backend");
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}
