use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use tracing::trace;

use crate::broker::{QueueSpec, RetryPolicy};

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct Config {
    #[serde(default)]
    pub broker: BrokerConfig,

    #[serde(default)]
    pub aggregator: AggregatorConfig,

    #[serde(default)]
    pub consumer: ConsumerConfig,

    /// Time granted to in-flight work after a shutdown signal
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Config {
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Message broker connection and queue contract
///
/// Publisher and consumer read the same section so they always agree on the
/// queue name and its durability.
#[derive(Clone, serde::Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_address")]
    pub address: String,

    #[serde(default = "default_broker_user")]
    pub username: String,

    #[serde(default = "default_broker_user")]
    pub password: String,

    #[serde(default = "default_vhost")]
    pub vhost: String,

    #[serde(default = "default_queue")]
    pub queue: String,

    #[serde(default = "default_true")]
    pub durable: bool,

    /// Maximum number of unacknowledged messages held by the consumer
    #[serde(default = "default_prefetch")]
    pub prefetch: u16,

    #[serde(default)]
    pub retry: RetryPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: default_broker_address(),
            username: default_broker_user(),
            password: default_broker_user(),
            vhost: default_vhost(),
            queue: default_queue(),
            durable: true,
            prefetch: default_prefetch(),
            retry: RetryPolicy::default(),
        }
    }
}

impl std::fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("address", &self.address)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .field("queue", &self.queue)
            .field("durable", &self.durable)
            .field("prefetch", &self.prefetch)
            .field("retry", &self.retry)
            .finish()
    }
}

impl BrokerConfig {
    /// Full AMQP URI including credentials and the encoded vhost
    pub fn uri(&self) -> String {
        let (scheme, host) = match self.address.split_once("://") {
            Some((scheme, host)) => (scheme, host),
            None => ("amqp", self.address.as_str()),
        };
        let host = host.trim_end_matches('/');
        let vhost = self.vhost.replace('/', "%2f");

        format!(
            "{scheme}://{}:{}@{host}/{vhost}",
            self.username, self.password
        )
    }

    pub fn queue_spec(&self) -> QueueSpec {
        QueueSpec {
            name: self.queue.clone(),
            durable: self.durable,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct AggregatorConfig {
    #[serde(default)]
    pub nodes: Vec<NodeConfig>,

    #[serde(default = "default_status_path")]
    pub status_path: String,

    /// Period of the background poll cycle
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Upper bound for a single probe request
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Optional ceiling for a whole poll cycle (unbounded when absent)
    pub cycle_deadline_secs: Option<u64>,

    #[serde(default)]
    pub api: ApiSection,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            nodes: vec![],
            status_path: default_status_path(),
            interval_secs: default_interval(),
            request_timeout_secs: default_request_timeout(),
            cycle_deadline_secs: None,
            api: ApiSection::default(),
        }
    }
}

impl AggregatorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cycle_deadline(&self) -> Option<Duration> {
        self.cycle_deadline_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct NodeConfig {
    /// Base address of the node, e.g. `http://10.0.0.2:8080`
    pub address: String,

    /// Identifier recorded with the node's readings (defaults to the address)
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, serde::Deserialize)]
pub struct ConsumerConfig {
    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    /// Pause after persisting each reading (throttles intake from the broker)
    #[serde(default)]
    pub persist_delay_ms: u64,

    #[serde(default)]
    pub api: ApiSection,
}

impl ConsumerConfig {
    pub fn persist_delay(&self) -> Duration {
        Duration::from_millis(self.persist_delay_ms)
    }
}

/// Durable store configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum StorageConfig {
    /// In-memory storage (no persistence)
    #[serde(rename = "none")]
    None,

    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
    },
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Sqlite {
            path: default_sqlite_path(),
        }
    }
}

/// Fast-lookup cache configuration
#[derive(Debug, Clone, serde::Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CacheConfig {
    /// In-process cache
    #[serde(rename = "none")]
    None {
        #[serde(default = "default_cache_ttl")]
        ttl_secs: u64,
    },

    Redis {
        #[serde(default = "default_redis_url")]
        url: String,

        #[serde(default = "default_cache_ttl")]
        ttl_secs: u64,
    },
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig::Redis {
            url: default_redis_url(),
            ttl_secs: default_cache_ttl(),
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        match self {
            CacheConfig::None { ttl_secs } | CacheConfig::Redis { ttl_secs, .. } => {
                Duration::from_secs(*ttl_secs)
            }
        }
    }
}

/// HTTP surface of a binary
#[derive(Debug, Clone, serde::Deserialize)]
pub struct ApiSection {
    #[serde(default = "default_bind")]
    pub bind: SocketAddr,

    pub token: Option<String>,

    #[serde(default = "default_true")]
    pub cors: bool,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token: None,
            cors: true,
        }
    }
}

fn default_broker_address() -> String {
    String::from("amqp://rabbitmq:5672")
}

fn default_broker_user() -> String {
    String::from("guest")
}

fn default_vhost() -> String {
    String::from("/")
}

fn default_queue() -> String {
    String::from("performance_status")
}

fn default_prefetch() -> u16 {
    1
}

fn default_true() -> bool {
    true
}

fn default_status_path() -> String {
    String::from("/status")
}

fn default_interval() -> u64 {
    5
}

fn default_request_timeout() -> u64 {
    30
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("./metrics.db")
}

fn default_redis_url() -> String {
    String::from("redis://redis:6379")
}

fn default_cache_ttl() -> u64 {
    24 * 60 * 60
}

fn default_bind() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8080))
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

pub fn read_config_file(path: &str) -> anyhow::Result<Config> {
    let file_content = std::fs::read_to_string(path)?;
    parse_config(&file_content)
}

pub fn parse_config(content: &str) -> anyhow::Result<Config> {
    let config: Config = serde_json::from_str(content)
        .map_err(|e| anyhow::anyhow!("Invalid configuration file provided: {e}"))?;

    // AMQP reads a prefetch of 0 as "no limit"
    anyhow::ensure!(
        config.broker.prefetch > 0,
        "Invalid configuration file provided: broker.prefetch must be at least 1"
    );

    trace!("loaded config: {config:?}");
    Ok(config)
}
