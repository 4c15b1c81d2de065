//! Connect-with-retry, shared by the publisher and the consumer

use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::backend::{Broker, BrokerSession, QueueSpec};
use super::error::{BrokerError, BrokerResult};

/// Fixed-delay retry policy for broker connections
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_delay_ms")]
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: default_delay_ms(),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay_ms: delay.as_millis() as u64,
        }
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }
}

fn default_max_attempts() -> u32 {
    30
}

fn default_delay_ms() -> u64 {
    2000
}

/// Open a session and declare the queue, retrying on failure
///
/// One attempt is a connect followed by the queue declaration; a session whose
/// declaration fails is closed and counted as a failed attempt. Between
/// attempts the policy's fixed delay is observed. Cancelling `cancel` aborts
/// the procedure with [`BrokerError::Cancelled`].
#[instrument(skip_all, fields(broker = %broker.describe(), queue = %queue.name))]
pub async fn connect_with_retry(
    broker: &dyn Broker,
    queue: &QueueSpec,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
) -> BrokerResult<Box<dyn BrokerSession>> {
    let attempts = policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=attempts {
        debug!("connecting to broker (attempt {attempt}/{attempts})");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
            result = open_and_declare(broker, queue) => result,
        };

        match result {
            Ok(session) => {
                info!("connected to broker, queue '{}' declared", queue.name);
                return Ok(session);
            }
            Err(e) => {
                warn!("failed to connect to broker (attempt {attempt}/{attempts}): {e}");
                last_error = e.to_string();
            }
        }

        if attempt < attempts {
            tokio::select! {
                _ = cancel.cancelled() => return Err(BrokerError::Cancelled),
                _ = tokio::time::sleep(policy.delay()) => {}
            }
        }
    }

    Err(BrokerError::RetriesExhausted {
        attempts,
        last_error,
    })
}

async fn open_and_declare(
    broker: &dyn Broker,
    queue: &QueueSpec,
) -> BrokerResult<Box<dyn BrokerSession>> {
    let session = broker.connect().await?;

    if let Err(e) = session.declare_queue(queue).await {
        let _ = session.close().await;
        return Err(e);
    }

    Ok(session)
}
