//! Aggregator - concurrent fan-out/fan-in over the node set
//!
//! Every node gets its own task. Results are collected in completion order,
//! so one slow node delays the end of the cycle without costing the other
//! nodes their readings. Without a cycle deadline the cycle lasts as long as
//! its slowest probe, which is bounded by the prober's request timeout.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tokio::time::{Instant, timeout_at};
use tracing::{debug, error, instrument, trace, warn};

use crate::{Batch, Reading};

use super::discovery::{Node, NodeDiscovery};
use super::probe::{Probe, ProbeError};

/// Why a cycle produced no readings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmptyReason {
    NoNodes,
    AllProbesFailed { attempted: usize },
}

impl fmt::Display for EmptyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EmptyReason::NoNodes => write!(f, "no nodes configured"),
            EmptyReason::AllProbesFailed { attempted } => {
                write!(f, "all {attempted} probes failed")
            }
        }
    }
}

/// Result of gathering one cycle
///
/// An empty cycle is not an error; errors are reserved for discovery failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    Batch(Batch),
    Empty(EmptyReason),
}

pub struct Aggregator {
    probe: Arc<dyn Probe>,
    discovery: Arc<dyn NodeDiscovery>,
    cycle_deadline: Option<Duration>,
}

impl Aggregator {
    pub fn new(probe: Arc<dyn Probe>, discovery: Arc<dyn NodeDiscovery>) -> Self {
        Self {
            probe,
            discovery,
            cycle_deadline: None,
        }
    }

    /// Bound the whole cycle; probes still running at the deadline are abandoned
    pub fn with_cycle_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.cycle_deadline = deadline;
        self
    }

    /// Resolve the node set and gather one cycle
    #[instrument(skip(self))]
    pub async fn collect(&self) -> anyhow::Result<CycleOutcome> {
        let nodes = self.discovery.discover().await?;
        Ok(self.gather(nodes).await)
    }

    /// Probe the given nodes concurrently
    pub async fn gather(&self, nodes: Vec<Node>) -> CycleOutcome {
        if nodes.is_empty() {
            debug!("no nodes to poll");
            return CycleOutcome::Empty(EmptyReason::NoNodes);
        }

        let attempted = nodes.len();
        let mut tasks = JoinSet::new();

        for node in nodes {
            let probe = self.probe.clone();
            tasks.spawn(async move {
                let result = probe.probe(&node).await;
                (node, result)
            });
        }

        let deadline = self.cycle_deadline.map(|d| Instant::now() + d);
        let mut batch = Batch::new();

        loop {
            let next = match deadline {
                Some(at) => match timeout_at(at, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(
                            "cycle deadline reached, abandoning {} outstanding probes",
                            tasks.len()
                        );
                        tasks.abort_all();
                        break;
                    }
                },
                None => tasks.join_next().await,
            };

            let Some(joined) = next else {
                break;
            };

            match joined {
                Ok((node, result)) => {
                    if let Some(reading) = record(&node, result) {
                        batch.push(reading);
                    }
                }
                Err(e) => error!("probe task failed: {e}"),
            }
        }

        debug!("cycle gathered {}/{attempted} readings", batch.len());

        if batch.is_empty() {
            CycleOutcome::Empty(EmptyReason::AllProbesFailed { attempted })
        } else {
            CycleOutcome::Batch(batch)
        }
    }
}

fn record(node: &Node, result: Result<Reading, ProbeError>) -> Option<Reading> {
    match result {
        Ok(reading) => {
            trace!("{} reported {}", node.source, reading.value);
            Some(reading)
        }
        Err(e) => {
            warn!("failed to poll {} ({}): {e}", node.source, node.status_url);
            None
        }
    }
}
