//! Endpoint prober - one bounded status fetch against one node

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use thiserror::Error;
use tracing::{instrument, trace};

use crate::Reading;

use super::discovery::Node;

/// Reasons a single probe contributes nothing to the batch
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("unexpected HTTP status {0}")]
    Status(StatusCode),

    #[error("failed to read response body: {0}")]
    Body(String),

    #[error("status body {body:?} is not an integer")]
    Parse { body: String },
}

/// Fetches one reading from one node
///
/// Implementations never retry; the next poll cycle is the retry.
#[async_trait]
pub trait Probe: Send + Sync {
    async fn probe(&self, node: &Node) -> Result<Reading, ProbeError>;
}

/// Probes nodes over HTTP with a shared client
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    /// Build a prober whose every request is bounded by `timeout`
    pub fn new(timeout: Duration) -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Probe for HttpProber {
    #[instrument(skip(self), fields(node = %node.source))]
    async fn probe(&self, node: &Node) -> Result<Reading, ProbeError> {
        trace!("requesting status from {}", node.status_url);

        let response = self.client.get(&node.status_url).send().await?;

        if !response.status().is_success() {
            return Err(ProbeError::Status(response.status()));
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProbeError::Body(e.to_string()))?;

        let value = parse_status_body(&body)?;
        Ok(Reading::new(node.source.clone(), value))
    }
}

/// Parse a status body: a bare decimal integer, surrounding whitespace ignored
pub fn parse_status_body(body: &str) -> Result<i64, ProbeError> {
    body.trim().parse::<i64>().map_err(|_| ProbeError::Parse {
        body: body.to_string(),
    })
}
