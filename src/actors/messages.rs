//! Message types for actor communication
//!
//! ## Design Principles
//!
//! 1. **Commands**: Request/response messages sent to specific actors via mpsc
//! 2. **State**: Actors publish their lifecycle state and counters on `watch` channels
//! 3. **Replies**: oneshot channels for synchronous queries

use std::fmt;

use serde::Serialize;
use tokio::sync::oneshot;

use crate::Batch;
use crate::poller::EmptyReason;

/// What one poll cycle did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleReport {
    /// The batch was handed to the broker
    Published(Batch),

    /// The batch was gathered but could not be published; it is dropped
    PublishFailed { batch: Batch, error: String },

    /// Nothing to publish
    Empty(EmptyReason),
}

/// Commands that can be sent to the SchedulerActor
#[derive(Debug)]
pub enum SchedulerCommand {
    /// Run a cycle immediately (bypassing the interval timer)
    PollNow {
        respond_to: oneshot::Sender<anyhow::Result<CycleReport>>,
    },

    /// Update the polling period; the timer restarts with the new period
    UpdateInterval { interval_secs: u64 },

    /// Stop after any in-flight cycle
    Shutdown,
}

/// Lifecycle of the resilient consumer
///
/// ```text
/// Disconnected → Connecting → Subscribed ⇄ Processing
///                                 │ connection lost
///                                 ▼
///                           Disconnected → Reconnecting → Subscribed | Fatal
/// ```
///
/// `Stopped` is reachable from every state through shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsumerState {
    Disconnected,
    Connecting,
    Subscribed,
    Processing,
    Reconnecting,
    Stopped,
    Fatal,
}

impl ConsumerState {
    /// Whether the consumer has stopped for good
    pub fn is_terminal(&self) -> bool {
        matches!(self, ConsumerState::Stopped | ConsumerState::Fatal)
    }
}

impl fmt::Display for ConsumerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConsumerState::Disconnected => "disconnected",
            ConsumerState::Connecting => "connecting",
            ConsumerState::Subscribed => "subscribed",
            ConsumerState::Processing => "processing",
            ConsumerState::Reconnecting => "reconnecting",
            ConsumerState::Stopped => "stopped",
            ConsumerState::Fatal => "fatal",
        };
        f.write_str(name)
    }
}

/// Consumer counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ConsumerStats {
    /// Messages received from the broker
    pub received: u64,

    /// Messages whose batch was persisted
    pub processed: u64,

    /// Poison messages dropped
    pub malformed: u64,

    pub acked: u64,
    pub ack_failures: u64,

    /// New records written to the store
    pub readings_persisted: u64,

    pub store_failures: u64,
    pub cache_failures: u64,

    /// Completed or attempted recovery procedures
    pub reconnects: u64,

    /// Current subscription generation (incremented on every resubscribe)
    pub generation: u64,
}
