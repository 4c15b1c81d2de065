//! Actor-based pipeline runtime
//!
//! Each actor runs as an independent async task communicating via Tokio
//! channels, and is controlled through a cloneable handle.
//!
//! ## Architecture Overview
//!
//! ```text
//!   aggregator process                          consumer process
//!  ┌───────────────────────────┐              ┌──────────────────────────────┐
//!  │ SchedulerActor ──┐        │              │ monitor ──► control task     │
//!  │ GET /aggregate ──┼► PollCycle ─► broker ─┼──────────► (ConsumerActor)   │
//!  └──────────────────┴────────┘    queue     │               │  Sinks      │
//!                                             └───────────────┴──────────────┘
//! ```
//!
//! ## Actor Types
//!
//! - **SchedulerActor**: Runs poll cycles on a fixed period
//! - **ConsumerActor**: Owns the subscription, persists and acknowledges
//!   messages, recovers from connection loss
//!
//! ## Communication Patterns
//!
//! 1. **Commands**: The scheduler has an mpsc command channel for control messages
//! 2. **State**: The consumer publishes its lifecycle and counters on `watch` channels
//! 3. **Request/Response**: oneshot channels for synchronous queries
//! 4. **Cancellation**: A process-wide `CancellationToken` stops every actor

pub mod consumer;
pub mod messages;
pub mod scheduler;

pub use consumer::{ConsumerHandle, ConsumerSettings};
pub use messages::{ConsumerState, ConsumerStats, CycleReport};
pub use scheduler::{PollCycle, SchedulerHandle};
