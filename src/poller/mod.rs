//! Fleet polling
//!
//! One poll cycle resolves the node set through [`NodeDiscovery`], probes
//! every node concurrently through a [`Probe`] and collects the successful
//! readings into a [`Batch`](crate::Batch) in completion order.
//!
//! ```text
//! discover() ──► [Node; N] ──► JoinSet { probe(n1) .. probe(nN) } ──► Batch (N - failures)
//! ```

pub mod aggregator;
pub mod discovery;
pub mod probe;

pub use aggregator::{Aggregator, CycleOutcome, EmptyReason};
pub use discovery::{Node, NodeDiscovery, StaticDiscovery};
pub use probe::{HttpProber, Probe, ProbeError, parse_status_body};
