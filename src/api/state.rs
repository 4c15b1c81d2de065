//! Shared state of the API routers

use std::sync::Arc;

use tokio::sync::watch;

use crate::actors::{ConsumerHandle, PollCycle};
use crate::storage::StorageBackend;

/// State of the trigger surface
#[derive(Clone)]
pub struct TriggerState {
    /// The same cycle instance the scheduler runs
    pub cycle: Arc<PollCycle>,
}

/// State of the report surface
#[derive(Clone)]
pub struct ReportState {
    pub store: Arc<dyn StorageBackend>,

    /// Current consumer; replaced by the supervisor on restart, `None` in between
    pub consumer: watch::Receiver<Option<ConsumerHandle>>,
}

impl ReportState {
    pub fn consumer(&self) -> Option<ConsumerHandle> {
        self.consumer.borrow().clone()
    }
}
