//! Message broker plumbing
//!
//! The pipeline talks to the broker through two traits: [`Broker`] opens a
//! transport session, [`BrokerSession`] owns it. Publisher and consumer hold
//! separate sessions and each replaces its own session wholesale on loss.
//!
//! ## Backends
//!
//! - **AMQP** (`amqp` feature): RabbitMQ or any AMQP 0-9-1 broker via lapin
//! - **In-Memory**: in-process broker with fault injection, used by tests
//!
//! ## Delivery guarantees
//!
//! - Publishing is fire-and-forget: persistent messages, no publisher confirms
//! - Consuming uses manual acknowledgement with bounded prefetch

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod backend;
pub mod delivery;
pub mod error;
pub mod memory;
pub mod retry;

pub use backend::{Acknowledger, Broker, BrokerSession, Delivery, DeliveryStream, QueueSpec};
pub use delivery::DeliveryChannel;
pub use error::{BrokerError, BrokerResult};
pub use retry::{RetryPolicy, connect_with_retry};
