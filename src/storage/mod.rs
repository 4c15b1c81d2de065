//! Durable store for persisted metrics
//!
//! The store is keyed by `(source, observed_at)`; inserting the same
//! observation twice leaves a single record. This is what makes redelivered
//! queue messages harmless for the store.
//!
//! ## Backends
//!
//! - **SQLite** (`storage-sqlite` feature): embedded database with migrations
//! - **In-Memory**: no persistence, for tests or `backend = "none"`
//!
//! ## Usage
//!
//! ```no_run
//! use fleetpulse::storage::{StorageBackend, sqlite::SqliteBackend};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let backend = SqliteBackend::new("./metrics.db").await?;
//!     let sources = backend.list_sources().await?;
//!     Ok(())
//! }
//! ```

pub mod backend;
pub mod error;
pub mod memory;
pub mod schema;
#[cfg(feature = "storage-sqlite")]
pub mod sqlite;

pub use backend::{HealthStatus, QueryRange, StorageBackend, StoreStats};
pub use error::{StorageError, StorageResult};
pub use memory::MemoryBackend;
pub use schema::PersistedMetric;
