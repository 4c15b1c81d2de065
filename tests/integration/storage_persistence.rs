//! SQLite persistence through the consumer

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fleetpulse::actors::ConsumerHandle;
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::cache::MemoryCache;
use fleetpulse::sinks::Sinks;
use fleetpulse::storage::sqlite::SqliteBackend;
use fleetpulse::storage::{PersistedMetric, StorageBackend};
use fleetpulse::{Batch, Reading};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use crate::helpers::*;

async fn sqlite(dir: &TempDir) -> Arc<SqliteBackend> {
    Arc::new(SqliteBackend::new(dir.path().join("metrics.db")).await.unwrap())
}

#[tokio::test]
async fn test_consumer_writes_to_sqlite() {
    let dir = TempDir::new().unwrap();
    let store = sqlite(&dir).await;
    let sinks = Arc::new(Sinks::new(
        store.clone(),
        Arc::new(MemoryCache::new()),
        Duration::from_secs(60),
    ));

    let broker = MemoryBroker::new();
    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks,
        consumer_settings(),
        CancellationToken::new(),
    )
    .await
    .unwrap();

    broker
        .inject(
            QUEUE,
            Batch::from(vec![Reading::new("n1", 10), Reading::new("n2", 20)])
                .encode()
                .unwrap(),
        )
        .await;

    wait_until(|| async { broker.acked_count(QUEUE).await == 1 }).await;

    let stats = store.get_stats().await.unwrap();
    assert_eq!(stats.total_metrics, 2);
    assert_eq!(stats.sources, 2);
    assert_eq!(stats.oldest, stats.newest);

    consumer.shutdown();
    consumer.terminated().await;
    store.close().await.unwrap();
}

#[tokio::test]
async fn test_metrics_survive_reopen() {
    let dir = TempDir::new().unwrap();
    let observed_at = Utc.timestamp_millis_opt(1_700_000_000_123).unwrap();

    {
        let store = sqlite(&dir).await;
        let metric = PersistedMetric::from_reading(&Reading::new("n1", 55), observed_at);
        assert!(store.insert_metric(&metric).await.unwrap());
        store.close().await.unwrap();
    }

    let store = sqlite(&dir).await;
    let latest = store.query_latest("n1", 10).await.unwrap();

    assert_eq!(latest.len(), 1);
    assert_eq!(latest[0].value, 55);
    assert_eq!(latest[0].observed_at, observed_at);

    // Reopening reruns migrations without touching the data
    let duplicate = PersistedMetric::from_reading(&Reading::new("n1", 99), observed_at);
    assert!(!store.insert_metric(&duplicate).await.unwrap());
    assert_eq!(store.query_latest("n1", 10).await.unwrap()[0].value, 55);
}

#[tokio::test]
async fn test_concurrent_duplicate_inserts_store_once() {
    let dir = TempDir::new().unwrap();
    let store = sqlite(&dir).await;
    let metric = PersistedMetric::from_reading(
        &Reading::new("n1", 1),
        Utc.timestamp_millis_opt(1_700_000_000_000).unwrap(),
    );

    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..8 {
        let store = store.clone();
        let metric = metric.clone();
        tasks.spawn(async move { store.insert_metric(&metric).await.unwrap() });
    }

    let mut inserted = 0;
    while let Some(result) = tasks.join_next().await {
        if result.unwrap() {
            inserted += 1;
        }
    }

    assert_eq!(inserted, 1);
    assert_eq!(store.get_stats().await.unwrap().total_metrics, 1);
}
