//! Failure tests for polling, publishing and persisting
//!
//! These tests verify that partial failures stay partial:
//! - Unreachable, failing, slow or garbled nodes
//! - Lost or unavailable broker connections
//! - Failing sinks

use std::sync::Arc;
use std::time::{Duration, Instant};

use assert_matches::assert_matches;
use async_trait::async_trait;
use fleetpulse::Reading;
use fleetpulse::actors::{ConsumerHandle, CycleReport, PollCycle};
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::poller::{
    Aggregator, CycleOutcome, EmptyReason, HttpProber, Node, NodeDiscovery, StaticDiscovery,
};
use fleetpulse::storage::StorageBackend;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::helpers::*;

async fn responding_node(template: ResponseTemplate) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(template)
        .mount(&server)
        .await;

    server
}

fn aggregator(nodes: Vec<Node>, timeout: Duration) -> Aggregator {
    Aggregator::new(
        Arc::new(HttpProber::new(timeout).unwrap()),
        Arc::new(StaticDiscovery::new(nodes)),
    )
}

#[tokio::test]
async fn test_failing_nodes_are_excluded() {
    let ok = status_node(" 33\n").await;
    let error = responding_node(ResponseTemplate::new(500).set_body_string("12")).await;
    let garbled = status_node("twelve").await;
    let slow = responding_node(
        ResponseTemplate::new(200)
            .set_body_string("1")
            .set_delay(Duration::from_secs(2)),
    )
    .await;

    let outcome = aggregator(
        vec![
            node_for("ok", &ok),
            node_for("error", &error),
            node_for("garbled", &garbled),
            node_for("slow", &slow),
            refused_node("down"),
        ],
        Duration::from_millis(300),
    )
    .collect()
    .await
    .unwrap();

    let batch = assert_matches!(outcome, CycleOutcome::Batch(batch) => batch);
    assert_eq!(batch.readings(), &[Reading::new("ok", 33)]);
}

#[tokio::test]
async fn test_all_nodes_failing_yields_no_message() {
    let error = responding_node(ResponseTemplate::new(503)).await;
    let garbled = status_node("").await;
    let broker = MemoryBroker::new();

    let cycle = poll_cycle(
        &broker,
        vec![
            node_for("error", &error),
            node_for("garbled", &garbled),
            refused_node("down"),
        ],
    )
    .await;

    let report = cycle.run().await.unwrap();

    assert_eq!(
        report,
        CycleReport::Empty(EmptyReason::AllProbesFailed { attempted: 3 })
    );
    assert_eq!(broker.published_count(QUEUE).await, 0);
}

#[tokio::test]
async fn test_cycle_deadline_abandons_slow_probes() {
    let fast = status_node("5").await;
    let slow = responding_node(
        ResponseTemplate::new(200)
            .set_body_string("6")
            .set_delay(Duration::from_secs(5)),
    )
    .await;

    let aggregator = aggregator(
        vec![node_for("fast", &fast), node_for("slow", &slow)],
        Duration::from_secs(30),
    )
    .with_cycle_deadline(Some(Duration::from_millis(300)));

    let started = Instant::now();
    let outcome = aggregator.collect().await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(3));
    let batch = assert_matches!(outcome, CycleOutcome::Batch(batch) => batch);
    assert_eq!(batch.readings(), &[Reading::new("fast", 5)]);
}

struct BrokenDiscovery;

#[async_trait]
impl NodeDiscovery for BrokenDiscovery {
    async fn discover(&self) -> anyhow::Result<Vec<Node>> {
        anyhow::bail!("inventory service unreachable")
    }
}

#[tokio::test]
async fn test_discovery_failure_is_reported() {
    let broker = MemoryBroker::new();
    let cycle = PollCycle::new(
        Aggregator::new(
            Arc::new(HttpProber::new(Duration::from_secs(1)).unwrap()),
            Arc::new(BrokenDiscovery),
        ),
        memory_delivery(&broker).await,
    );

    let error = cycle.run().await.unwrap_err();

    assert!(format!("{error:#}").contains("inventory service unreachable"));
    assert_eq!(broker.published_count(QUEUE).await, 0);
}

#[tokio::test]
async fn test_publisher_replaces_lost_connection() {
    let n1 = status_node("10").await;
    let broker = MemoryBroker::new();
    let cycle = poll_cycle(&broker, vec![node_for("n1", &n1)]).await;

    assert_matches!(cycle.run().await.unwrap(), CycleReport::Published(_));
    assert_eq!(broker.drop_connections().await, 1);

    assert_matches!(cycle.run().await.unwrap(), CycleReport::Published(_));
    assert_eq!(broker.connect_count().await, 2);
    assert_eq!(broker.published_count(QUEUE).await, 2);
}

#[tokio::test]
async fn test_unreachable_broker_drops_the_batch() {
    let n1 = status_node("10").await;
    let broker = MemoryBroker::new();
    let cycle = poll_cycle(&broker, vec![node_for("n1", &n1)]).await;

    broker.set_offline(true).await;
    broker.drop_connections().await;

    let report = cycle.run().await.unwrap();
    let batch = assert_matches!(report, CycleReport::PublishFailed { batch, .. } => batch);
    assert_eq!(batch.readings(), &[Reading::new("n1", 10)]);
    assert_eq!(broker.published_count(QUEUE).await, 0);

    // The next cycle is the retry; the dropped batch is not resent
    broker.set_offline(false).await;
    assert_matches!(cycle.run().await.unwrap(), CycleReport::Published(_));
    assert_eq!(broker.published_count(QUEUE).await, 1);
}

#[tokio::test]
async fn test_failing_cache_does_not_block_the_store() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    sinks.cache.set_failing(true);

    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    broker
        .inject(
            QUEUE,
            br#"[{"endpoint": "n1", "value": 1}, {"endpoint": "n2", "value": 2}]"#.to_vec(),
        )
        .await;

    wait_until(|| async { consumer.stats().acked == 1 }).await;

    let stats = consumer.stats();
    assert_eq!(stats.cache_failures, 2);
    assert_eq!(stats.readings_persisted, 2);
    assert_eq!(sinks.store.list_sources().await.unwrap(), vec!["n1", "n2"]);
    assert!(sinks.cache.is_empty().await);

    consumer.shutdown();
    consumer.terminated().await;
}

#[tokio::test]
async fn test_failing_store_still_fills_the_cache() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    sinks.store.set_failing(true);

    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    broker
        .inject(QUEUE, br#"[{"endpoint": "n1", "value": 1}]"#.to_vec())
        .await;

    wait_until(|| async { consumer.stats().acked == 1 }).await;

    assert_eq!(consumer.stats().store_failures, 1);
    assert_eq!(sinks.cache.len().await, 1);
    assert!(sinks.cache.keys().await[0].starts_with("n1:"));

    consumer.shutdown();
    consumer.terminated().await;
}
