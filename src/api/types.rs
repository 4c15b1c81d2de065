//! API response types

use serde::{Deserialize, Serialize};

use crate::actors::{ConsumerState, ConsumerStats};
use crate::storage::{HealthStatus, PersistedMetric, StoreStats};

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// `ok`, or `degraded` when the consumer or the store is not operational
    pub status: String,
    pub timestamp: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub consumer: Option<ConsumerState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage: Option<HealthStatus>,
}

#[derive(Debug, Serialize)]
pub struct MetricsResponse {
    pub metrics: Vec<PersistedMetric>,
    pub count: usize,
}

impl From<Vec<PersistedMetric>> for MetricsResponse {
    fn from(metrics: Vec<PersistedMetric>) -> Self {
        Self {
            count: metrics.len(),
            metrics,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SourcesResponse {
    pub sources: Vec<String>,
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub timestamp: String,

    /// Absent while the consumer is restarting
    pub consumer: Option<ConsumerStats>,

    pub consumer_state: Option<ConsumerState>,
    pub store: StoreStats,
}

/// Query parameters of the metric listings
#[derive(Debug, Default, Deserialize)]
pub struct MetricQuery {
    /// Start time (ISO 8601); with `end`, selects a time range
    pub start: Option<chrono::DateTime<chrono::Utc>>,

    /// End time (ISO 8601, default: now)
    pub end: Option<chrono::DateTime<chrono::Utc>>,

    /// Max results (default: 100, at most 1000)
    pub limit: Option<usize>,
}

pub const DEFAULT_LIMIT: usize = 100;
pub const MAX_LIMIT: usize = 1000;

impl MetricQuery {
    pub fn limit(&self) -> usize {
        self.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT)
    }
}
