//! Storage backend trait definition

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::error::StorageResult;
use super::schema::PersistedMetric;

/// Query parameters for fetching one source's metrics within a time range
#[derive(Debug, Clone)]
pub struct QueryRange {
    pub source: String,

    /// Start of time range (inclusive)
    pub start: DateTime<Utc>,

    /// End of time range (inclusive)
    pub end: DateTime<Utc>,

    pub limit: Option<usize>,
}

/// Health status of the storage backend
#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub healthy: bool,

    /// Human-readable status message
    pub message: String,

    /// Additional backend-specific metadata
    pub metadata: HashMap<String, String>,
}

/// Aggregate figures about the stored data
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub backend: String,
    pub total_metrics: u64,
    pub sources: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

/// Trait for durable metric stores
///
/// Implementations must be `Send + Sync`; the consumer and the report API
/// share one instance.
///
/// Every query returns metrics in chronological order (oldest first).
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Insert one metric idempotently
    ///
    /// Returns `true` when a new record was written and `false` when a record
    /// with the same `(source, observed_at)` already existed.
    async fn insert_metric(&self, metric: &PersistedMetric) -> StorageResult<bool>;

    /// Metrics of one source within a time range
    async fn query_range(&self, query: QueryRange) -> StorageResult<Vec<PersistedMetric>>;

    /// The `limit` most recent metrics of one source
    async fn query_latest(&self, source: &str, limit: usize)
    -> StorageResult<Vec<PersistedMetric>>;

    /// The `limit` most recent metrics across all sources
    async fn query_recent(&self, limit: usize) -> StorageResult<Vec<PersistedMetric>>;

    /// Every source with at least one stored metric, sorted
    async fn list_sources(&self) -> StorageResult<Vec<String>>;

    /// Lightweight check that the backend is operational
    async fn health_check(&self) -> StorageResult<HealthStatus>;

    async fn get_stats(&self) -> StorageResult<StoreStats>;

    /// Release resources; later writes fail
    async fn close(&self) -> StorageResult<()>;
}
