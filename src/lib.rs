pub mod actors;
#[cfg(feature = "api")]
pub mod api;
pub mod broker;
pub mod cache;
pub mod config;
pub mod poller;
pub mod shutdown;
pub mod sinks;
pub mod storage;
pub mod util;

use serde::{Deserialize, Serialize};

/// One node's reported value from a single poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reading {
    /// Identifier of the node that produced the value
    #[serde(rename = "endpoint")]
    pub source: String,

    pub value: i64,
}

impl Reading {
    pub fn new(source: impl Into<String>, value: i64) -> Self {
        Self {
            source: source.into(),
            value,
        }
    }
}

/// The readings gathered within one poll cycle, in completion order
///
/// On the wire a batch is a bare JSON array of `{"endpoint": string, "value": integer}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Batch {
    readings: Vec<Reading>,
}

impl Batch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, reading: Reading) {
        self.readings.push(reading);
    }

    pub fn readings(&self) -> &[Reading] {
        &self.readings
    }

    pub fn into_readings(self) -> Vec<Reading> {
        self.readings
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }

    /// Serialize the batch into its wire format
    pub fn encode(&self) -> serde_json::Result<Vec<u8>> {
        serde_json::to_vec(self)
    }

    /// Parse a batch from its wire format
    pub fn decode(payload: &[u8]) -> serde_json::Result<Self> {
        serde_json::from_slice(payload)
    }
}

impl From<Vec<Reading>> for Batch {
    fn from(readings: Vec<Reading>) -> Self {
        Self { readings }
    }
}

impl FromIterator<Reading> for Batch {
    fn from_iter<T: IntoIterator<Item = Reading>>(iter: T) -> Self {
        Self {
            readings: iter.into_iter().collect(),
        }
    }
}
