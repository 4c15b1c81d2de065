//! End-to-end tests: nodes → aggregator → broker → consumer → sinks

use std::collections::HashMap;
use std::sync::Arc;

use assert_matches::assert_matches;
use fleetpulse::actors::{ConsumerHandle, ConsumerState, CycleReport};
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::cache::{CacheBackend, cache_key};
use fleetpulse::poller::EmptyReason;
use fleetpulse::storage::StorageBackend;
use fleetpulse::{Batch, Reading};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

#[tokio::test]
async fn test_two_of_three_nodes_flow_into_the_sinks() {
    let n1 = status_node("10").await;
    let n2 = status_node("20").await;
    let broker = MemoryBroker::new();

    let cycle = poll_cycle(
        &broker,
        vec![node_for("n1", &n1), node_for("n2", &n2), refused_node("n3")],
    )
    .await;

    let report = cycle.run().await.unwrap();
    let batch = assert_matches!(report, CycleReport::Published(batch) => batch);
    assert_eq!(batch.len(), 2);

    // Exactly one message, carrying both readings in some order
    let queued = broker.ready_payloads(QUEUE).await;
    assert_eq!(queued.len(), 1);
    let mut readings = Batch::decode(&queued[0]).unwrap().into_readings();
    readings.sort_by(|a, b| a.source.cmp(&b.source));
    assert_eq!(
        readings,
        vec![Reading::new("n1", 10), Reading::new("n2", 20)]
    );

    let sinks = memory_sinks();
    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    wait_until(|| async { broker.acked_count(QUEUE).await == 1 }).await;

    let stored: HashMap<String, i64> = sinks
        .store
        .query_recent(10)
        .await
        .unwrap()
        .into_iter()
        .map(|metric| (metric.source.clone(), metric.value))
        .collect();
    assert_eq!(stored.len(), 2);
    assert_eq!(stored["n1"], 10);
    assert_eq!(stored["n2"], 20);
    assert!(!stored.contains_key("n3"));

    // Both readings share one observation time, and the cache mirrors the store
    let metrics = sinks.store.query_recent(10).await.unwrap();
    assert_eq!(metrics[0].observed_at, metrics[1].observed_at);
    for metric in &metrics {
        let key = cache_key(&metric.source, metric.observed_at);
        assert_eq!(sinks.cache.get(&key).await.unwrap(), Some(metric.value));
    }

    assert_eq!(broker.ready_count(QUEUE).await, 0);
    assert_eq!(broker.unacked_count(QUEUE).await, 0);

    consumer.shutdown();
    assert_eq!(consumer.terminated().await, ConsumerState::Stopped);
}

#[tokio::test]
async fn test_empty_node_set_publishes_nothing() {
    let broker = MemoryBroker::new();
    let cycle = poll_cycle(&broker, vec![]).await;

    let report = cycle.run().await.unwrap();

    assert_eq!(report, CycleReport::Empty(EmptyReason::NoNodes));
    assert_eq!(broker.published_count(QUEUE).await, 0);
}

#[tokio::test]
async fn test_every_cycle_publishes_one_message() {
    let n1 = status_node("7").await;
    let broker = MemoryBroker::new();
    let cycle = poll_cycle(&broker, vec![node_for("n1", &n1)]).await;

    for _ in 0..3 {
        assert_matches!(cycle.run().await.unwrap(), CycleReport::Published(_));
    }

    assert_eq!(broker.published_count(QUEUE).await, 3);
    assert_eq!(broker.ready_count(QUEUE).await, 3);
    assert_eq!(broker.queue_durability(QUEUE).await, Some(true));
}

#[tokio::test]
async fn test_consumer_drains_backlog_in_order() {
    let broker = MemoryBroker::new();
    for value in 1..=5 {
        broker
            .inject(
                QUEUE,
                Batch::from(vec![Reading::new(format!("n{value}"), value)])
                    .encode()
                    .unwrap(),
            )
            .await;
    }

    let sinks = memory_sinks();
    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    wait_until(|| async { consumer.stats().acked == 5 }).await;

    assert_eq!(
        sinks.store.list_sources().await.unwrap(),
        vec!["n1", "n2", "n3", "n4", "n5"]
    );

    let stats = consumer.stats();
    assert_eq!(stats.received, 5);
    assert_eq!(stats.processed, 5);
    assert_eq!(stats.acked, 5);

    consumer.shutdown();
    consumer.terminated().await;
}
