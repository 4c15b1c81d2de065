//! Delivery Channel - publish side of the pipeline
//!
//! Owns the publisher's broker session. The session is replaced (never shared
//! with the consumer) whenever it is found closed; the replacement runs the
//! same connect-with-retry procedure used at startup.
//!
//! ## Guarantees
//!
//! - A batch is serialized once and sent at most once
//! - A failed publish drops the batch; there is no local retry buffer
//! - No publisher confirms: success means the message left this process

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::Batch;

use super::backend::{Broker, BrokerSession, QueueSpec};
use super::error::{BrokerError, BrokerResult};
use super::retry::{RetryPolicy, connect_with_retry};

pub struct DeliveryChannel {
    broker: Arc<dyn Broker>,
    queue: QueueSpec,
    retry: RetryPolicy,
    cancel: CancellationToken,

    /// Current session; only `publish` and `close` replace it
    session: Mutex<Option<Box<dyn BrokerSession>>>,
}

impl std::fmt::Debug for DeliveryChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeliveryChannel")
            .field("queue", &self.queue)
            .finish_non_exhaustive()
    }
}

impl DeliveryChannel {
    /// Connect at startup
    ///
    /// Exhausting the retry budget here is returned to the caller, which cannot
    /// proceed without the broker.
    #[instrument(skip_all, fields(queue = %queue.name))]
    pub async fn connect(
        broker: Arc<dyn Broker>,
        queue: QueueSpec,
        retry: RetryPolicy,
        cancel: CancellationToken,
    ) -> BrokerResult<Self> {
        let session = connect_with_retry(broker.as_ref(), &queue, &retry, &cancel).await?;
        info!("delivery channel ready");

        Ok(Self {
            broker,
            queue,
            retry,
            cancel,
            session: Mutex::new(Some(session)),
        })
    }

    pub fn queue(&self) -> &QueueSpec {
        &self.queue
    }

    /// Serialize and publish a batch
    ///
    /// A closed session is replaced first; if that reconnect fails the error is
    /// returned and the batch is dropped. Publish errors that indicate a lost
    /// connection discard the session so the next call reconnects.
    #[instrument(skip_all, fields(readings = batch.len()))]
    pub async fn publish(&self, batch: &Batch) -> BrokerResult<()> {
        let payload = batch.encode()?;

        let mut session = self.session.lock().await;

        if session.as_ref().is_none_or(|s| !s.is_open()) {
            if let Some(stale) = session.take() {
                warn!("publisher connection lost, reconnecting");
                let _ = stale.close().await;
            }

            let fresh =
                connect_with_retry(self.broker.as_ref(), &self.queue, &self.retry, &self.cancel)
                    .await?;
            *session = Some(fresh);
        }

        let Some(current) = session.as_ref() else {
            return Err(BrokerError::ConnectionClosed);
        };

        match current.publish(&self.queue.name, &payload).await {
            Ok(()) => {
                debug!("published batch ({} bytes)", payload.len());
                Ok(())
            }
            Err(e) => {
                if e.is_connection_loss() || !current.is_open() {
                    if let Some(stale) = session.take() {
                        let _ = stale.close().await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Close the publisher session
    pub async fn close(&self) {
        if let Some(session) = self.session.lock().await.take() {
            debug!("closing delivery channel");
            if let Err(e) = session.close().await {
                warn!("error closing publisher session: {e}");
            }
        }
    }
}
