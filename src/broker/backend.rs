//! Broker and session trait definitions
//!
//! A [`BrokerSession`] is the Connection Handle of the pipeline: exactly one
//! live session per logical connection, replaced rather than repaired when
//! the transport is lost.

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

use super::error::BrokerResult;

/// Name and durability contract of the target queue
///
/// Publisher and consumer must declare the queue with identical flags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
        }
    }
}

/// Acknowledges a single delivery on the session it arrived on
#[async_trait]
pub trait Acknowledger: Send {
    async fn ack(self: Box<Self>) -> BrokerResult<()>;
}

/// A message received from a subscription
///
/// The broker keeps the message unacknowledged (and redelivers it if the
/// session dies) until [`Delivery::ack`] succeeds.
pub struct Delivery {
    pub payload: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(payload: Vec<u8>, redelivered: bool, acker: Box<dyn Acknowledger>) -> Self {
        Self {
            payload,
            redelivered,
            acker,
        }
    }

    pub async fn ack(self) -> BrokerResult<()> {
        self.acker.ack().await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("payload_len", &self.payload.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}

/// Stream of deliveries for one subscription
///
/// The stream ends (or yields an error) when the underlying session is lost.
pub type DeliveryStream = BoxStream<'static, BrokerResult<Delivery>>;

/// Factory for broker sessions
#[async_trait]
pub trait Broker: Send + Sync {
    /// Open a new transport session
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerSession>>;

    /// Human-readable broker location for logs (never includes credentials)
    fn describe(&self) -> String;
}

/// One live transport session to the broker
#[async_trait]
pub trait BrokerSession: Send + Sync {
    /// Declare a queue idempotently
    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()>;

    /// Send a persistent message to a queue through the default exchange
    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()>;

    /// Subscribe with manual acknowledgement and bounded prefetch
    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream>;

    /// Token cancelled once the session is closed or its transport is lost
    ///
    /// This is the asynchronous connection-closed notification, independent of
    /// any delivery stream.
    fn closed(&self) -> CancellationToken;

    fn is_open(&self) -> bool {
        !self.closed().is_cancelled()
    }

    /// Close the session; afterwards every operation fails with `ConnectionClosed`
    async fn close(&self) -> BrokerResult<()>;
}

impl fmt::Debug for dyn BrokerSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerSession")
            .field("open", &self.is_open())
            .finish()
    }
}
