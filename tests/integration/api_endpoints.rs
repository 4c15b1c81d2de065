//! HTTP API tests against a live server

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use fleetpulse::Reading;
use fleetpulse::actors::ConsumerHandle;
use fleetpulse::api::{
    ApiConfig, ReportState, TriggerState, report_router, spawn_api_server, trigger_router,
};
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::storage::{MemoryBackend, PersistedMetric, StorageBackend};
use reqwest::StatusCode;
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use url::Url;

use crate::helpers::*;

fn local_config() -> ApiConfig {
    ApiConfig {
        bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..ApiConfig::default()
    }
}

fn endpoint(addr: SocketAddr, path: &str) -> Url {
    Url::parse(&format!("http://{addr}"))
        .unwrap()
        .join(path)
        .unwrap()
}

async fn get_json(url: Url) -> (StatusCode, Value) {
    let response = reqwest::get(url).await.unwrap();
    let status = response.status();
    (status, response.json().await.unwrap())
}

async fn seeded_store() -> Arc<MemoryBackend> {
    let store = Arc::new(MemoryBackend::new());
    for (offset, value) in [(0, 10), (1_000, 11), (2_000, 12)] {
        let observed_at = Utc
            .timestamp_millis_opt(1_700_000_000_000 + offset)
            .unwrap();
        store
            .insert_metric(&PersistedMetric::from_reading(
                &Reading::new("n1", value),
                observed_at,
            ))
            .await
            .unwrap();
    }
    store
        .insert_metric(&PersistedMetric::from_reading(
            &Reading::new("n2", 20),
            Utc.timestamp_millis_opt(1_700_000_000_500).unwrap(),
        ))
        .await
        .unwrap();
    store
}

#[tokio::test]
async fn test_aggregate_without_nodes_returns_500() {
    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();
    let state = TriggerState {
        cycle: Arc::new(poll_cycle(&broker, vec![]).await),
    };

    let (addr, server) = spawn_api_server(local_config(), trigger_router(state), cancel.clone())
        .await
        .unwrap();

    let (status, body) = get_json(endpoint(addr, "/aggregate")).await;

    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, json!({ "error": "No valid responses received" }));
    assert_eq!(broker.published_count(QUEUE).await, 0);

    cancel.cancel();
    tokio::time::timeout(Duration::from_secs(5), server)
        .await
        .unwrap()
        .unwrap();
}

#[tokio::test]
async fn test_aggregate_returns_published_batch() {
    let n1 = status_node("64").await;
    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();
    let state = TriggerState {
        cycle: Arc::new(poll_cycle(&broker, vec![node_for("n1", &n1)]).await),
    };

    let (addr, _server) = spawn_api_server(local_config(), trigger_router(state), cancel.clone())
        .await
        .unwrap();

    let (status, body) = get_json(endpoint(addr, "/aggregate")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!([{ "endpoint": "n1", "value": 64 }]));
    assert_eq!(broker.published_count(QUEUE).await, 1);

    cancel.cancel();
}

#[tokio::test]
async fn test_aggregate_reports_unavailable_broker() {
    let n1 = status_node("64").await;
    let broker = MemoryBroker::new();
    let cancel = CancellationToken::new();
    let state = TriggerState {
        cycle: Arc::new(poll_cycle(&broker, vec![node_for("n1", &n1)]).await),
    };

    broker.set_offline(true).await;
    broker.drop_connections().await;

    let (addr, _server) = spawn_api_server(local_config(), trigger_router(state), cancel.clone())
        .await
        .unwrap();

    let (status, body) = get_json(endpoint(addr, "/aggregate")).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert!(body["error"].as_str().unwrap().contains("failed to publish"));

    cancel.cancel();
}

#[tokio::test]
async fn test_report_endpoints() {
    let store = seeded_store().await;
    let cancel = CancellationToken::new();
    let (_tx, rx) = watch::channel(None);
    let state = ReportState {
        store: store.clone(),
        consumer: rx,
    };

    let (addr, _server) = spawn_api_server(local_config(), report_router(state), cancel.clone())
        .await
        .unwrap();

    let (status, body) = get_json(endpoint(addr, "/api/v1/sources")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({ "sources": ["n1", "n2"], "count": 2 }));

    let (status, body) = get_json(endpoint(addr, "/api/v1/metrics/n1?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 2);
    assert_eq!(body["metrics"][0]["value"], 11);
    assert_eq!(body["metrics"][1]["value"], 12);

    let (status, body) = get_json(endpoint(
        addr,
        "/api/v1/metrics/n1?start=2023-11-14T22:13:20Z&end=2023-11-14T22:13:20.500Z",
    ))
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert_eq!(body["metrics"][0]["value"], 10);

    let (status, _) = get_json(endpoint(
        addr,
        "/api/v1/metrics/n1?start=2023-11-15T00:00:00Z&end=2023-11-14T00:00:00Z",
    ))
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = get_json(endpoint(addr, "/api/v1/metrics?limit=2")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["metrics"][0]["value"], 11);
    assert_eq!(body["metrics"][1]["value"], 12);

    let (status, body) = get_json(endpoint(addr, "/api/v1/stats")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["store"]["total_metrics"], 4);
    assert_eq!(body["consumer"], Value::Null);

    cancel.cancel();
}

#[tokio::test]
async fn test_health_and_stats_follow_the_consumer() {
    let broker = MemoryBroker::new();
    let sinks = memory_sinks();
    let cancel = CancellationToken::new();
    let consumer = ConsumerHandle::start(
        Arc::new(broker.clone()),
        sinks.sinks.clone(),
        consumer_settings(),
        cancel.clone(),
    )
    .await
    .unwrap();

    let (_tx, rx) = watch::channel(Some(consumer.clone()));
    let state = ReportState {
        store: sinks.store.clone(),
        consumer: rx,
    };
    let (addr, _server) = spawn_api_server(local_config(), report_router(state), cancel.clone())
        .await
        .unwrap();

    broker
        .inject(QUEUE, br#"[{"endpoint": "n1", "value": 3}]"#.to_vec())
        .await;
    wait_until(|| async { consumer.stats().acked == 1 }).await;

    let (status, body) = get_json(endpoint(addr, "/api/v1/health")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["consumer"], "subscribed");

    let (_, body) = get_json(endpoint(addr, "/api/v1/stats")).await;
    assert_eq!(body["consumer_state"], "subscribed");
    assert_eq!(body["consumer"]["processed"], 1);
    assert_eq!(body["store"]["total_metrics"], 1);

    cancel.cancel();
    consumer.terminated().await;
}
