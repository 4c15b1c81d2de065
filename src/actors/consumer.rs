//! Resilient consumer - subscribe, persist, acknowledge, recover
//!
//! A single control task owns the subscription and is the only place where
//! the consumer's state changes. Two independent signals report a lost
//! connection: the session's `closed()` notification (watched by a small
//! monitor task) and the end of the delivery stream. Both arrive as events
//! in the control loop, so they can never start two overlapping recoveries.
//!
//! ```text
//!                 ┌──────────────┐ ConnectionLost(gen)  ┌──────────────┐
//!                 │   monitor    │─────────────────────►│              │
//!                 └──────────────┘                      │   control    │──► Sinks ──► ack
//!   broker ──► delivery stream (prefetch = N) ─────────►│     task     │
//!                                                       │              │──► state, stats
//!                                                       └──────────────┘
//! ```
//!
//! State and counters are published on `watch` channels, so readers never
//! wait on the control task while it persists a batch or reconnects.
//!
//! Every subscription carries a generation number. Recovery tears the old
//! subscription down (monitor aborted, stream dropped, session closed) before
//! opening a new one under the next generation; loss events tagged with an
//! older generation are ignored.

use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::Batch;
use crate::broker::{
    Broker, BrokerError, BrokerResult, BrokerSession, Delivery, DeliveryStream, QueueSpec,
    RetryPolicy, connect_with_retry,
};
use crate::config::BrokerConfig;
use crate::sinks::Sinks;

use super::messages::{ConsumerState, ConsumerStats};

/// Queue contract and flow control of the consumer
#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub queue: QueueSpec,
    pub prefetch: u16,
    pub retry: RetryPolicy,
}

impl ConsumerSettings {
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            queue: config.queue_spec(),
            prefetch: config.prefetch,
            retry: config.retry,
        }
    }
}

/// One live subscription and everything tied to its session
struct Subscription {
    session: Box<dyn BrokerSession>,
    stream: DeliveryStream,
    monitor: JoinHandle<()>,
}

impl Subscription {
    async fn teardown(self) {
        self.monitor.abort();
        drop(self.stream);
        if let Err(e) = self.session.close().await {
            debug!("error closing stale session: {e}");
        }
    }
}

/// Connect, declare and subscribe; the session is closed on failure
async fn open_subscription(
    broker: &dyn Broker,
    settings: &ConsumerSettings,
    cancel: &CancellationToken,
    generation: u64,
    lost_tx: mpsc::UnboundedSender<u64>,
) -> BrokerResult<Subscription> {
    let session = connect_with_retry(broker, &settings.queue, &settings.retry, cancel).await?;

    let stream = match session
        .consume(&settings.queue.name, settings.prefetch)
        .await
    {
        Ok(stream) => stream,
        Err(e) => {
            let _ = session.close().await;
            return Err(e);
        }
    };

    let closed = session.closed();
    let monitor = tokio::spawn(async move {
        closed.cancelled().await;
        let _ = lost_tx.send(generation);
    });

    info!(
        "subscribed to '{}' (prefetch {}, generation {generation})",
        settings.queue.name, settings.prefetch
    );

    Ok(Subscription {
        session,
        stream,
        monitor,
    })
}

enum Event {
    Stop,
    ConnectionLost(u64),
    Delivery(Option<BrokerResult<Delivery>>),
}

struct ConsumerActor {
    broker: Arc<dyn Broker>,
    sinks: Arc<Sinks>,
    settings: ConsumerSettings,
    stop: CancellationToken,
    state_tx: watch::Sender<ConsumerState>,
    stats_tx: watch::Sender<ConsumerStats>,
    lost_tx: mpsc::UnboundedSender<u64>,
    lost_rx: mpsc::UnboundedReceiver<u64>,
    subscription: Option<Subscription>,
    stats: ConsumerStats,
    done: CancellationToken,
}

impl ConsumerActor {
    #[instrument(skip(self), fields(queue = %self.settings.queue.name))]
    async fn run(mut self) {
        debug!("starting consumer control loop");

        let final_state = loop {
            let Some(subscription) = self.subscription.as_mut() else {
                break ConsumerState::Fatal;
            };

            let event = tokio::select! {
                biased;

                _ = self.stop.cancelled() => Event::Stop,
                Some(generation) = self.lost_rx.recv() => Event::ConnectionLost(generation),
                next = subscription.stream.next() => Event::Delivery(next),
            };

            match event {
                Event::Stop => {
                    info!("shutdown requested");
                    break ConsumerState::Stopped;
                }

                Event::ConnectionLost(generation) if generation != self.stats.generation => {
                    debug!("ignoring stale connection-loss notice for generation {generation}");
                }

                Event::ConnectionLost(_) => {
                    if let Some(state) = self.recover("connection closed").await {
                        break state;
                    }
                }

                Event::Delivery(Some(Ok(delivery))) => self.process(delivery).await,

                Event::Delivery(Some(Err(e))) => {
                    warn!("delivery stream failed: {e}");
                    if let Some(state) = self.recover("delivery stream error").await {
                        break state;
                    }
                }

                Event::Delivery(None) => {
                    if let Some(state) = self.recover("delivery stream ended").await {
                        break state;
                    }
                }
            }
        };

        if let Some(subscription) = self.subscription.take() {
            subscription.teardown().await;
        }

        self.set_state(final_state);
        self.done.cancel();
        debug!("consumer control loop stopped");
    }

    /// Handle one message; returns once it is acknowledged (or the ack failed)
    async fn process(&mut self, delivery: Delivery) {
        self.stats.received += 1;
        self.publish_stats();
        self.set_state(ConsumerState::Processing);

        match Batch::decode(&delivery.payload) {
            Ok(batch) => {
                let report = self.sinks.persist_batch(&batch).await;
                self.stats.processed += 1;
                self.stats.readings_persisted += report.stored as u64;
                self.stats.store_failures += report.store_failures as u64;
                self.stats.cache_failures += report.cache_failures as u64;
            }
            Err(e) => {
                warn!(
                    "dropping malformed message ({} bytes): {e}",
                    delivery.payload.len()
                );
                self.stats.malformed += 1;
            }
        }

        match delivery.ack().await {
            Ok(()) => self.stats.acked += 1,
            Err(e) => {
                // The broker redelivers it once the connection is replaced
                warn!("failed to acknowledge message: {e}");
                self.stats.ack_failures += 1;
            }
        }

        self.set_state(ConsumerState::Subscribed);
        self.publish_stats();
    }

    /// Replace the lost subscription
    ///
    /// Returns the terminal state when recovery is impossible.
    async fn recover(&mut self, trigger: &str) -> Option<ConsumerState> {
        warn!("connection lost ({trigger}), recovering");
        self.set_state(ConsumerState::Disconnected);

        if let Some(stale) = self.subscription.take() {
            stale.teardown().await;
        }

        self.stats.reconnects += 1;
        self.publish_stats();
        self.set_state(ConsumerState::Reconnecting);
        let generation = self.stats.generation + 1;

        match open_subscription(
            self.broker.as_ref(),
            &self.settings,
            &self.stop,
            generation,
            self.lost_tx.clone(),
        )
        .await
        {
            Ok(subscription) => {
                self.subscription = Some(subscription);
                self.stats.generation = generation;
                self.set_state(ConsumerState::Subscribed);
                self.publish_stats();
                None
            }
            Err(BrokerError::Cancelled) => Some(ConsumerState::Stopped),
            Err(e) => {
                error!("reconnect failed: {e}");
                Some(ConsumerState::Fatal)
            }
        }
    }

    fn publish_stats(&self) {
        self.stats_tx.send_replace(self.stats);
    }

    fn set_state(&self, state: ConsumerState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            match state {
                ConsumerState::Processing | ConsumerState::Subscribed => {
                    debug!("consumer {previous} -> {state}")
                }
                _ => info!("consumer {previous} -> {state}"),
            }
        }
    }
}

/// Handle for controlling the resilient consumer
#[derive(Clone, Debug)]
pub struct ConsumerHandle {
    state: watch::Receiver<ConsumerState>,
    stats: watch::Receiver<ConsumerStats>,
    stop: CancellationToken,
    done: CancellationToken,
}

impl ConsumerHandle {
    /// Connect, subscribe and spawn the control task
    ///
    /// Failing to reach the broker here is returned; later losses are
    /// recovered internally. The consumer stops when `cancel` fires or
    /// [`ConsumerHandle::shutdown`] is called.
    #[instrument(skip_all, fields(queue = %settings.queue.name))]
    pub async fn start(
        broker: Arc<dyn Broker>,
        sinks: Arc<Sinks>,
        settings: ConsumerSettings,
        cancel: CancellationToken,
    ) -> BrokerResult<Self> {
        let (state_tx, state_rx) = watch::channel(ConsumerState::Disconnected);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        let stop = cancel.child_token();

        state_tx.send_replace(ConsumerState::Connecting);
        let subscription =
            open_subscription(broker.as_ref(), &settings, &stop, 1, lost_tx.clone()).await?;
        state_tx.send_replace(ConsumerState::Subscribed);

        let stats = ConsumerStats {
            generation: 1,
            ..ConsumerStats::default()
        };
        let (stats_tx, stats_rx) = watch::channel(stats);
        let done = CancellationToken::new();

        let actor = ConsumerActor {
            broker,
            sinks,
            settings,
            stop: stop.clone(),
            state_tx,
            stats_tx,
            lost_tx,
            lost_rx,
            subscription: Some(subscription),
            stats,
            done: done.clone(),
        };

        tokio::spawn(actor.run());

        Ok(Self {
            state: state_rx,
            stats: stats_rx,
            stop,
            done,
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Receiver of every state change
    pub fn watch_state(&self) -> watch::Receiver<ConsumerState> {
        self.state.clone()
    }

    /// Counters as of the last completed step; never waits on the control task
    pub fn stats(&self) -> ConsumerStats {
        *self.stats.borrow()
    }

    /// Stop after the message in flight (if any) is acknowledged
    pub fn shutdown(&self) {
        self.stop.cancel();
    }

    /// Resolves once the control task has exited; returns the final state
    pub async fn terminated(&self) -> ConsumerState {
        self.done.cancelled().await;
        self.state()
    }
}
