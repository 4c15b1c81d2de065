//! Consumer resilience: poison messages, outages, redelivery and restarts

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use fleetpulse::actors::{ConsumerHandle, ConsumerSettings, ConsumerState};
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::broker::{Broker, BrokerError, QueueSpec};
use fleetpulse::sinks::Sinks;
use fleetpulse::storage::StorageBackend;
use fleetpulse::{Batch, Reading};
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

fn payload(source: &str, value: i64) -> Vec<u8> {
    Batch::from(vec![Reading::new(source, value)]).encode().unwrap()
}

async fn start(broker: &MemoryBroker, sinks: Arc<Sinks>) -> ConsumerHandle {
    ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks,
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

#[tokio::test]
async fn test_poison_message_is_acked_and_skipped() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let consumer = start(&broker, sinks.sinks.clone()).await;

    broker.inject(QUEUE, b"not json".to_vec()).await;
    broker.inject(QUEUE, payload("n1", 42)).await;

    wait_until(|| async { consumer.stats().acked == 2 }).await;

    let stats = consumer.stats();
    assert_eq!(stats.malformed, 1);
    assert_eq!(stats.processed, 1);
    assert_eq!(sinks.store.list_sources().await.unwrap(), vec!["n1"]);
    assert_eq!(broker.ready_count(QUEUE).await, 0);
    assert_eq!(consumer.state(), ConsumerState::Subscribed);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_wrong_shape_is_treated_as_malformed() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let consumer = start(&broker, sinks.sinks.clone()).await;

    broker
        .inject(QUEUE, br#"[{"endpoint": "n1", "value": "high"}]"#.to_vec())
        .await;
    broker
        .inject(QUEUE, br#"{"endpoint": "n1", "value": 1}"#.to_vec())
        .await;

    wait_until(|| async { consumer.stats().acked == 2 }).await;

    assert_eq!(consumer.stats().malformed, 2);
    assert!(sinks.store.is_empty().await);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_messages_published_during_outage_arrive_after_recovery() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let consumer = start(&broker, sinks.sinks.clone()).await;

    broker.set_offline(true).await;
    broker.drop_connections().await;

    let mut states = consumer.watch_state();
    states
        .wait_for(|state| *state == ConsumerState::Reconnecting)
        .await
        .unwrap();

    broker.inject(QUEUE, payload("n1", 5)).await;
    broker.inject(QUEUE, payload("n2", 6)).await;
    broker.set_offline(false).await;

    wait_until(|| async { consumer.stats().acked == 2 }).await;

    let stats = consumer.stats();
    assert_eq!(stats.reconnects, 1);
    assert_eq!(stats.generation, 2);
    assert_eq!(sinks.store.len().await, 2);
    assert_eq!(broker.live_sessions().await, 1);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_in_flight_message_is_redelivered_after_connection_loss() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let slow = Arc::new(
        Sinks::new(
            sinks.store.clone(),
            sinks.cache.clone(),
            Duration::from_secs(60),
        )
        .with_persist_delay(Duration::from_millis(200)),
    );
    let consumer = start(&broker, slow).await;

    broker.inject(QUEUE, payload("n1", 9)).await;

    let mut states = consumer.watch_state();
    states
        .wait_for(|state| *state == ConsumerState::Processing)
        .await
        .unwrap();
    broker.drop_connections().await;

    wait_until(|| async { consumer.stats().acked == 1 }).await;

    let stats = consumer.stats();
    assert_eq!(stats.ack_failures, 1);
    assert_eq!(stats.received, 2);
    assert_eq!(stats.acked, 1);
    assert_eq!(stats.reconnects, 1);
    assert_eq!(broker.ready_count(QUEUE).await, 0);
    assert_eq!(broker.unacked_count(QUEUE).await, 0);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_shutdown_finishes_the_message_in_flight() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let slow = Arc::new(
        Sinks::new(
            sinks.store.clone(),
            sinks.cache.clone(),
            Duration::from_secs(60),
        )
        .with_persist_delay(Duration::from_millis(300)),
    );
    let consumer = start(&broker, slow).await;

    broker.inject(QUEUE, payload("n1", 4)).await;

    let mut states = consumer.watch_state();
    states
        .wait_for(|state| *state == ConsumerState::Processing)
        .await
        .unwrap();
    consumer.shutdown();

    let state = tokio::time::timeout(Duration::from_secs(5), consumer.terminated())
        .await
        .unwrap();
    assert_eq!(state, ConsumerState::Stopped);
    assert_eq!(broker.acked_count(QUEUE).await, 1);
    assert_eq!(broker.ready_count(QUEUE).await, 0);
    assert_eq!(sinks.store.len().await, 1);
    assert_eq!(consumer.stats().acked, 1);
    assert_eq!(broker.live_sessions().await, 0);
}

#[tokio::test]
async fn test_repeated_losses_keep_a_single_subscription() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let consumer = start(&broker, sinks.sinks.clone()).await;

    for round in 2..=4 {
        broker.drop_connections().await;
        wait_until(|| async { consumer.stats().generation == round }).await;
    }

    assert_eq!(broker.consumer_count(QUEUE).await, 1);
    assert_eq!(broker.live_sessions().await, 1);
    assert_eq!(consumer.stats().reconnects, 3);

    broker.inject(QUEUE, payload("n1", 1)).await;
    wait_until(|| async { sinks.store.len().await == 1 }).await;

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_refused_connections_are_retried_at_startup() {
    let broker = MemoryBroker::new();
    broker.refuse_connections(2).await;
    let sinks = memory_sinks();

    let consumer = start(&broker, sinks.sinks.clone()).await;

    assert_eq!(broker.connect_attempts().await, 3);
    assert_eq!(consumer.state(), ConsumerState::Subscribed);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_durability_mismatch_never_subscribes() {
    let broker = MemoryBroker::new();
    let session = broker.connect().await.unwrap();
    session
        .declare_queue(&QueueSpec {
            name: QUEUE.to_string(),
            durable: false,
        })
        .await
        .unwrap();

    let sinks = memory_sinks();
    let result = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        ConsumerSettings {
            retry: fast_retry(2),
            ..consumer_settings()
        },
        CancellationToken::new(),
    )
    .await;

    assert_matches!(result, Err(BrokerError::RetriesExhausted { attempts: 2, .. }));
    assert_eq!(broker.consumer_count(QUEUE).await, 0);
}

#[tokio::test]
async fn test_durable_backlog_survives_broker_restart() {
    let broker = MemoryBroker::new();
    broker.inject(QUEUE, payload("n1", 3)).await;

    broker.restart().await;
    assert_eq!(broker.ready_count(QUEUE).await, 1);

    let sinks = memory_sinks();
    let consumer = start(&broker, sinks.sinks.clone()).await;

    wait_until(|| async { broker.acked_count(QUEUE).await == 1 }).await;
    assert_eq!(sinks.store.len().await, 1);

    consumer.shutdown();
    consumer.terminated().await;
}
