//! Helper functions for integration tests

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use fleetpulse::actors::{ConsumerSettings, PollCycle};
use fleetpulse::broker::memory::MemoryBroker;
use fleetpulse::broker::{DeliveryChannel, QueueSpec, RetryPolicy};
use fleetpulse::cache::MemoryCache;
use fleetpulse::poller::{Aggregator, HttpProber, Node, StaticDiscovery};
use fleetpulse::sinks::Sinks;
use fleetpulse::storage::MemoryBackend;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const QUEUE: &str = "performance_status";

pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::new(max_attempts, Duration::from_millis(10))
}

pub fn consumer_settings() -> ConsumerSettings {
    ConsumerSettings {
        queue: QueueSpec::durable(QUEUE),
        prefetch: 1,
        retry: fast_retry(5),
    }
}

/// Status node answering `GET /status` with `body`
pub async fn status_node(body: &str) -> MockServer {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/status"))
        .respond_with(ResponseTemplate::new(200).set_body_string(body))
        .mount(&server)
        .await;

    server
}

pub fn node_for(source: &str, server: &MockServer) -> Node {
    Node::new(source, format!("{}/status", server.uri()))
}

/// A status URL on a port nothing listens on
pub fn refused_node(source: &str) -> Node {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    Node::new(source, format!("http://{addr}/status"))
}

pub async fn memory_delivery(broker: &MemoryBroker) -> DeliveryChannel {
    DeliveryChannel::connect(
        Arc::new(broker.clone()),
        QueueSpec::durable(QUEUE),
        fast_retry(3),
        CancellationToken::new(),
    )
    .await
    .unwrap()
}

pub async fn poll_cycle(broker: &MemoryBroker, nodes: Vec<Node>) -> PollCycle {
    let aggregator = Aggregator::new(
        Arc::new(HttpProber::new(Duration::from_secs(2)).unwrap()),
        Arc::new(StaticDiscovery::new(nodes)),
    );

    PollCycle::new(aggregator, memory_delivery(broker).await)
}

pub struct TestSinks {
    pub store: Arc<MemoryBackend>,
    pub cache: Arc<MemoryCache>,
    pub sinks: Arc<Sinks>,
}

pub fn memory_sinks() -> TestSinks {
    let store = Arc::new(MemoryBackend::new());
    let cache = Arc::new(MemoryCache::new());
    let sinks = Arc::new(Sinks::new(
        store.clone(),
        cache.clone(),
        Duration::from_secs(60),
    ));

    TestSinks {
        store,
        cache,
        sinks,
    }
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
