//! Persisted metric row
//!
//! Timestamps are stored as Unix milliseconds, so an `observed_at` carries
//! millisecond precision everywhere; [`observation_time`] truncates the clock
//! accordingly, which keeps the identity stable across backends.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::Reading;

/// One stored observation; identity is `(source, observed_at)`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedMetric {
    pub source: String,
    pub value: i64,
    pub observed_at: DateTime<Utc>,
}

impl PersistedMetric {
    pub fn from_reading(reading: &Reading, observed_at: DateTime<Utc>) -> Self {
        Self {
            source: reading.source.clone(),
            value: reading.value,
            observed_at,
        }
    }
}

/// Current time at storage precision
pub fn observation_time() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}
