//! SchedulerActor - drives poll cycles on a fixed period
//!
//! ## Message Flow
//!
//! ```text
//! Timer tick ─┐
//! PollNow ────┼─► PollCycle::run ─► Aggregator ─► Batch ─► DeliveryChannel::publish
//! /aggregate ─┘        (shared via Arc, independent of the timer)
//! ```
//!
//! The HTTP trigger calls [`PollCycle::run`] directly, so on-demand cycles
//! never wait for the timer and the timer never waits for them.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::broker::DeliveryChannel;
use crate::poller::{Aggregator, CycleOutcome};

use super::messages::{CycleReport, SchedulerCommand};

/// Shortest period the timer will run at
const MIN_PERIOD: Duration = Duration::from_secs(1);

/// One discover → aggregate → publish pass
pub struct PollCycle {
    aggregator: Aggregator,
    delivery: DeliveryChannel,
}

impl PollCycle {
    pub fn new(aggregator: Aggregator, delivery: DeliveryChannel) -> Self {
        Self {
            aggregator,
            delivery,
        }
    }

    pub fn delivery(&self) -> &DeliveryChannel {
        &self.delivery
    }

    /// Run one cycle
    ///
    /// The batch is published at most once; an empty batch is not published.
    /// Only a discovery failure is returned as an error.
    #[instrument(skip(self))]
    pub async fn run(&self) -> Result<CycleReport> {
        let outcome = self
            .aggregator
            .collect()
            .await
            .context("failed to resolve node set")?;

        let batch = match outcome {
            CycleOutcome::Batch(batch) => batch,
            CycleOutcome::Empty(reason) => {
                info!("skipping publish: {reason}");
                return Ok(CycleReport::Empty(reason));
            }
        };

        match self.delivery.publish(&batch).await {
            Ok(()) => {
                info!("published batch of {} readings", batch.len());
                Ok(CycleReport::Published(batch))
            }
            Err(e) => {
                error!("failed to publish batch, dropping it: {e}");
                Ok(CycleReport::PublishFailed {
                    batch,
                    error: e.to_string(),
                })
            }
        }
    }
}

/// Actor running the background poll timer
pub struct SchedulerActor {
    cycle: Arc<PollCycle>,
    command_rx: mpsc::Receiver<SchedulerCommand>,
    interval_duration: Duration,
    cancel: CancellationToken,

    /// Cancelled when the actor exits
    done: CancellationToken,
}

impl SchedulerActor {
    #[instrument(skip(self), fields(interval = ?self.interval_duration))]
    pub async fn run(mut self) {
        debug!("starting scheduler actor");

        let mut ticker = Self::ticker(self.interval_duration);

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    debug!("cancellation requested");
                    break;
                }

                _ = ticker.tick() => {
                    if let Err(e) = self.cycle.run().await {
                        error!("poll cycle failed: {:#}", e);
                    }
                }

                Some(cmd) = self.command_rx.recv() => {
                    match cmd {
                        SchedulerCommand::PollNow { respond_to } => {
                            debug!("received PollNow command");
                            let result = self.cycle.run().await;
                            let _ = respond_to.send(result);
                        }

                        SchedulerCommand::UpdateInterval { interval_secs } => {
                            debug!("updating interval to {interval_secs}s");
                            self.interval_duration =
                                Duration::from_secs(interval_secs).max(MIN_PERIOD);
                            ticker = Self::ticker(self.interval_duration);
                        }

                        SchedulerCommand::Shutdown => {
                            debug!("received shutdown command");
                            break;
                        }
                    }
                }

                else => {
                    warn!("command channel closed, shutting down");
                    break;
                }
            }
        }

        self.done.cancel();
        debug!("scheduler actor stopped");
    }

    fn ticker(period: Duration) -> tokio::time::Interval {
        let mut ticker = interval(period);
        // A cycle can outlast the period; never burst to catch up
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker
    }
}

/// Handle for controlling a SchedulerActor
#[derive(Clone)]
pub struct SchedulerHandle {
    sender: mpsc::Sender<SchedulerCommand>,
    done: CancellationToken,
}

impl SchedulerHandle {
    /// Spawn the scheduler; it stops when `cancel` fires
    pub fn spawn(cycle: Arc<PollCycle>, period: Duration, cancel: CancellationToken) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(32);
        let done = CancellationToken::new();

        let actor = SchedulerActor {
            cycle,
            command_rx: cmd_rx,
            interval_duration: period.max(MIN_PERIOD),
            cancel,
            done: done.clone(),
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            done,
        }
    }

    /// Run a cycle now and wait for its report
    pub async fn poll_now(&self) -> Result<CycleReport> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(SchedulerCommand::PollNow { respond_to: tx })
            .await
            .context("failed to send PollNow command")?;

        rx.await.context("failed to receive response")?
    }

    pub async fn update_interval(&self, interval_secs: u64) -> Result<()> {
        self.sender
            .send(SchedulerCommand::UpdateInterval { interval_secs })
            .await
            .context("failed to send UpdateInterval command")?;
        Ok(())
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(SchedulerCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }

    /// Resolves once the actor has exited
    pub async fn stopped(&self) {
        self.done.cancelled().await;
    }
}
