//! In-memory broker backend
//!
//! An in-process broker that mirrors the AMQP behaviour the pipeline relies
//! on. It is useful for:
//! - Testing the publisher and the consumer without a running broker
//! - Simulating connection loss, refused connections and broker restarts
//!
//! ## Semantics
//!
//! - Queues are declared idempotently; re-declaring with a different
//!   durability flag fails like AMQP `PRECONDITION_FAILED`
//! - Each subscription holds at most `prefetch` unacknowledged messages
//! - When a session dies its unacknowledged messages return to the head of
//!   the queue, flagged as redelivered, and its delivery streams end
//! - Operations on a dead session fail with `ConnectionClosed`

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use futures::channel::mpsc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use super::backend::{Acknowledger, Broker, BrokerSession, Delivery, DeliveryStream, QueueSpec};
use super::error::{BrokerError, BrokerResult};

type Shared = Arc<Mutex<BrokerState>>;

/// In-memory broker
///
/// Cloning yields another handle to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Shared,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    sessions: HashMap<u64, CancellationToken>,
    next_session: u64,
    next_consumer: u64,
    connect_attempts: usize,
    connects: usize,
    refused_remaining: usize,
    channel_faults: usize,
    offline: bool,
}

struct MemoryQueue {
    durable: bool,
    ready: VecDeque<Message>,
    consumers: Vec<MemoryConsumer>,
    next_tag: u64,
    published: usize,
    acked: usize,
}

struct Message {
    payload: Vec<u8>,
    redelivered: bool,
}

struct MemoryConsumer {
    id: u64,
    session: u64,
    prefetch: u16,
    tx: mpsc::UnboundedSender<Delivery>,
    unacked: HashMap<u64, Vec<u8>>,
}

impl MemoryConsumer {
    fn has_capacity(&self) -> bool {
        self.prefetch == 0 || self.unacked.len() < self.prefetch as usize
    }
}

impl MemoryQueue {
    fn new(durable: bool) -> Self {
        Self {
            durable,
            ready: VecDeque::new(),
            consumers: Vec::new(),
            next_tag: 0,
            published: 0,
            acked: 0,
        }
    }

    /// Push ready messages to consumers that have prefetch capacity
    fn dispatch(&mut self, queue_name: &str, shared: &Shared) {
        while !self.ready.is_empty() {
            let Some(index) = self.consumers.iter().position(MemoryConsumer::has_capacity) else {
                break;
            };
            let Some(message) = self.ready.pop_front() else {
                break;
            };

            self.next_tag += 1;
            let tag = self.next_tag;
            let consumer = &mut self.consumers[index];

            let delivery = Delivery::new(
                message.payload.clone(),
                message.redelivered,
                Box::new(MemoryAcker {
                    shared: shared.clone(),
                    queue: queue_name.to_string(),
                    session: consumer.session,
                    consumer: consumer.id,
                    tag,
                }),
            );

            if consumer.tx.unbounded_send(delivery).is_ok() {
                trace!("delivered tag {tag} on '{queue_name}' to consumer {}", consumer.id);
                consumer.unacked.insert(tag, message.payload);
            } else {
                // Receiver dropped: the subscription is gone
                let dead = self.consumers.remove(index);
                self.requeue(dead);
                self.ready.push_front(message);
            }
        }
    }

    fn requeue(&mut self, consumer: MemoryConsumer) {
        let mut unacked: Vec<_> = consumer.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| *tag);

        for (_, payload) in unacked.into_iter().rev() {
            self.ready.push_front(Message {
                payload,
                redelivered: true,
            });
        }
    }
}

impl BrokerState {
    fn is_alive(&self, session: u64) -> bool {
        self.sessions
            .get(&session)
            .is_some_and(|token| !token.is_cancelled())
    }

    /// Tear down a session: cancel it, end its streams, requeue its messages
    fn kill_session(&mut self, session: u64, shared: &Shared) {
        if let Some(token) = self.sessions.remove(&session) {
            token.cancel();
        }

        for (name, queue) in self.queues.iter_mut() {
            let (dead, alive): (Vec<_>, Vec<_>) = queue
                .consumers
                .drain(..)
                .partition(|consumer| consumer.session == session);
            queue.consumers = alive;

            for consumer in dead {
                queue.requeue(consumer);
            }

            queue.dispatch(name, shared);
        }
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Refuse the next `count` connection attempts
    pub async fn refuse_connections(&self, count: usize) {
        self.state.lock().await.refused_remaining = count;
    }

    /// Refuse every connection attempt while offline
    pub async fn set_offline(&self, offline: bool) {
        self.state.lock().await.offline = offline;
    }

    /// Drop every live connection, as a network partition would
    ///
    /// Returns the number of sessions that were dropped.
    pub async fn drop_connections(&self) -> usize {
        let mut state = self.state.lock().await;
        let sessions: Vec<u64> = state.sessions.keys().copied().collect();

        for session in &sessions {
            state.kill_session(*session, &self.state);
        }

        debug!("dropped {} broker sessions", sessions.len());
        sessions.len()
    }

    /// Fail the next `count` publishes with a channel exception
    ///
    /// The publishing session is closed with the error, as the broker closes
    /// a channel it raised an exception on, but the error itself is not a
    /// connection loss.
    pub async fn fail_channel_on_publish(&self, count: usize) {
        self.state.lock().await.channel_faults = count;
    }

    /// Drop every connection and discard non-durable queues with their messages
    pub async fn restart(&self) {
        self.drop_connections().await;
        self.state
            .lock()
            .await
            .queues
            .retain(|_, queue| queue.durable);
    }

    /// Enqueue a raw payload, bypassing any session
    pub async fn inject(&self, queue: &str, payload: impl Into<Vec<u8>>) {
        let mut state = self.state.lock().await;
        let entry = state
            .queues
            .entry(queue.to_string())
            .or_insert_with(|| MemoryQueue::new(true));

        entry.published += 1;
        entry.ready.push_back(Message {
            payload: payload.into(),
            redelivered: false,
        });
        entry.dispatch(queue, &self.state);
    }

    pub async fn connect_attempts(&self) -> usize {
        self.state.lock().await.connect_attempts
    }

    /// Number of successful connections
    pub async fn connect_count(&self) -> usize {
        self.state.lock().await.connects
    }

    pub async fn live_sessions(&self) -> usize {
        let state = self.state.lock().await;
        state
            .sessions
            .values()
            .filter(|token| !token.is_cancelled())
            .count()
    }

    pub async fn queue_durability(&self, queue: &str) -> Option<bool> {
        self.with_queue(queue, |q| q.durable).await
    }

    pub async fn consumer_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.consumers.len())
            .await
            .unwrap_or(0)
    }

    /// Prefetch setting of each active subscription on a queue
    pub async fn consumer_prefetch(&self, queue: &str) -> Vec<u16> {
        self.with_queue(queue, |q| q.consumers.iter().map(|c| c.prefetch).collect())
            .await
            .unwrap_or_default()
    }

    pub async fn ready_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.ready.len()).await.unwrap_or(0)
    }

    pub async fn ready_payloads(&self, queue: &str) -> Vec<Vec<u8>> {
        self.with_queue(queue, |q| q.ready.iter().map(|m| m.payload.clone()).collect())
            .await
            .unwrap_or_default()
    }

    pub async fn unacked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.consumers.iter().map(|c| c.unacked.len()).sum())
            .await
            .unwrap_or(0)
    }

    pub async fn acked_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.acked).await.unwrap_or(0)
    }

    pub async fn published_count(&self, queue: &str) -> usize {
        self.with_queue(queue, |q| q.published).await.unwrap_or(0)
    }

    async fn with_queue<T>(&self, queue: &str, f: impl FnOnce(&MemoryQueue) -> T) -> Option<T> {
        self.state.lock().await.queues.get(queue).map(f)
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self) -> BrokerResult<Box<dyn BrokerSession>> {
        let mut state = self.state.lock().await;
        state.connect_attempts += 1;

        if state.offline {
            return Err(BrokerError::ConnectionFailed(
                "connection refused (broker offline)".to_string(),
            ));
        }

        if state.refused_remaining > 0 {
            state.refused_remaining -= 1;
            return Err(BrokerError::ConnectionFailed(
                "connection refused".to_string(),
            ));
        }

        state.next_session += 1;
        state.connects += 1;
        let id = state.next_session;
        let closed = CancellationToken::new();
        state.sessions.insert(id, closed.clone());

        trace!("opened in-memory session {id}");

        Ok(Box::new(MemorySession {
            id,
            shared: self.state.clone(),
            closed,
        }))
    }

    fn describe(&self) -> String {
        String::from("memory")
    }
}

struct MemorySession {
    id: u64,
    shared: Shared,
    closed: CancellationToken,
}

impl MemorySession {
    fn ensure_open(&self, state: &BrokerState) -> BrokerResult<()> {
        if state.is_alive(self.id) {
            Ok(())
        } else {
            Err(BrokerError::ConnectionClosed)
        }
    }
}

#[async_trait]
impl BrokerSession for MemorySession {
    async fn declare_queue(&self, queue: &QueueSpec) -> BrokerResult<()> {
        let mut state = self.shared.lock().await;
        self.ensure_open(&state)?;

        match state.queues.get(&queue.name) {
            Some(existing) if existing.durable != queue.durable => {
                Err(BrokerError::DeclareFailed(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{}'",
                    queue.name
                )))
            }
            Some(_) => Ok(()),
            None => {
                state
                    .queues
                    .insert(queue.name.clone(), MemoryQueue::new(queue.durable));
                Ok(())
            }
        }
    }

    async fn publish(&self, queue: &str, payload: &[u8]) -> BrokerResult<()> {
        let mut state = self.shared.lock().await;
        self.ensure_open(&state)?;

        if state.channel_faults > 0 {
            state.channel_faults -= 1;
            state.kill_session(self.id, &self.shared);
            return Err(BrokerError::PublishFailed(
                "channel closed by broker: PRECONDITION_FAILED".to_string(),
            ));
        }

        // The default exchange silently drops messages for unknown queues
        let Some(target) = state.queues.get_mut(queue) else {
            debug!("no queue '{queue}', message dropped");
            return Ok(());
        };

        target.published += 1;
        target.ready.push_back(Message {
            payload: payload.to_vec(),
            redelivered: false,
        });
        target.dispatch(queue, &self.shared);

        Ok(())
    }

    async fn consume(&self, queue: &str, prefetch: u16) -> BrokerResult<DeliveryStream> {
        let mut state = self.shared.lock().await;
        self.ensure_open(&state)?;

        state.next_consumer += 1;
        let id = state.next_consumer;

        let Some(target) = state.queues.get_mut(queue) else {
            return Err(BrokerError::SubscribeFailed(format!(
                "NOT_FOUND - no queue '{queue}'"
            )));
        };

        let (tx, rx) = mpsc::unbounded();
        target.consumers.push(MemoryConsumer {
            id,
            session: self.id,
            prefetch,
            tx,
            unacked: HashMap::new(),
        });
        target.dispatch(queue, &self.shared);

        Ok(rx.map(Ok::<_, BrokerError>).boxed())
    }

    fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    async fn close(&self) -> BrokerResult<()> {
        let mut state = self.shared.lock().await;
        state.kill_session(self.id, &self.shared);
        self.closed.cancel();
        Ok(())
    }
}

struct MemoryAcker {
    shared: Shared,
    queue: String,
    session: u64,
    consumer: u64,
    tag: u64,
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(self: Box<Self>) -> BrokerResult<()> {
        let mut state = self.shared.lock().await;

        if !state.is_alive(self.session) {
            return Err(BrokerError::ConnectionClosed);
        }

        let Some(queue) = state.queues.get_mut(&self.queue) else {
            return Err(BrokerError::ConnectionClosed);
        };

        let acknowledged = queue
            .consumers
            .iter_mut()
            .find(|consumer| consumer.id == self.consumer)
            .and_then(|consumer| consumer.unacked.remove(&self.tag))
            .is_some();

        if !acknowledged {
            return Err(BrokerError::AckFailed(format!(
                "unknown delivery tag {}",
                self.tag
            )));
        }

        queue.acked += 1;
        queue.dispatch(&self.queue, &self.shared);

        Ok(())
    }
}
