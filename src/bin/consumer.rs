use std::sync::Arc;

use clap::Parser;
use fleetpulse::actors::{ConsumerHandle, ConsumerSettings, ConsumerState};
use fleetpulse::api::{ApiConfig, ReportState, report_router, spawn_api_server};
use fleetpulse::broker::Broker;
use fleetpulse::broker::amqp::AmqpBroker;
use fleetpulse::cache::{CacheBackend, MemoryCache, redis::RedisCache};
use fleetpulse::config::{CacheConfig, StorageConfig, read_config_file};
use fleetpulse::shutdown::{cancel_on_signal, with_grace};
use fleetpulse::sinks::Sinks;
use fleetpulse::storage::{MemoryBackend, StorageBackend, sqlite::SqliteBackend};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, level_filters::LevelFilter, warn};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("fleetpulse", LevelFilter::TRACE),
        ("fleetpulse_consumer", LevelFilter::TRACE),
    ]);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(false),
        )
        .with(filter)
        .init();
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Consumes batches and persists readings")]
struct Args {
    #[arg(short)]
    file: String,
}

async fn open_store(config: &StorageConfig) -> anyhow::Result<Arc<dyn StorageBackend>> {
    let store: Arc<dyn StorageBackend> = match config {
        StorageConfig::None => {
            warn!("storage backend 'none': readings are kept in memory only");
            Arc::new(MemoryBackend::new())
        }
        StorageConfig::Sqlite { path } => {
            info!("opening sqlite store at {}", path.display());
            Arc::new(SqliteBackend::new(path).await?)
        }
    };
    Ok(store)
}

async fn open_cache(config: &CacheConfig) -> anyhow::Result<Arc<dyn CacheBackend>> {
    let cache: Arc<dyn CacheBackend> = match config {
        CacheConfig::None { .. } => Arc::new(MemoryCache::new()),
        CacheConfig::Redis { url, .. } => Arc::new(RedisCache::connect(url).await?),
    };
    Ok(cache)
}

/// Keep a consumer running until `cancel` fires
///
/// A consumer that gives up after exhausting its reconnect budget is started
/// again after one retry delay. The current handle is published on `current`.
async fn supervise(
    first: ConsumerHandle,
    broker: Arc<dyn Broker>,
    sinks: Arc<Sinks>,
    settings: ConsumerSettings,
    cancel: CancellationToken,
    current: watch::Sender<Option<ConsumerHandle>>,
) {
    let mut handle = first;

    loop {
        current.send_replace(Some(handle.clone()));

        let state = handle.terminated().await;
        if cancel.is_cancelled() || state != ConsumerState::Fatal {
            break;
        }

        error!(
            "consumer gave up on the broker, restarting in {}ms",
            settings.retry.delay_ms
        );

        handle = loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settings.retry.delay()) => {}
            }

            match ConsumerHandle::start(
                broker.clone(),
                sinks.clone(),
                settings.clone(),
                cancel.clone(),
            )
            .await
            {
                Ok(handle) => break handle,
                Err(e) if cancel.is_cancelled() => {
                    info!("consumer restart cancelled: {e}");
                    return;
                }
                Err(e) => error!("consumer restart failed: {e}"),
            }
        };
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let Args { file } = Args::parse();
    let config = read_config_file(&file)?;
    let consumer_config = &config.consumer;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let store = open_store(&consumer_config.storage).await?;
    let cache = open_cache(&consumer_config.cache).await?;
    let sinks = Arc::new(
        Sinks::new(store.clone(), cache, consumer_config.cache.ttl())
            .with_persist_delay(consumer_config.persist_delay()),
    );

    let broker: Arc<dyn Broker> = Arc::new(AmqpBroker::new(&config.broker));
    let settings = ConsumerSettings::from_config(&config.broker);

    let handle =
        ConsumerHandle::start(broker.clone(), sinks.clone(), settings.clone(), cancel.clone())
            .await?;

    let (current_tx, current_rx) = watch::channel(None);
    let supervisor = tokio::spawn(supervise(
        handle,
        broker,
        sinks,
        settings,
        cancel.clone(),
        current_tx,
    ));

    let api_config = ApiConfig::from(&consumer_config.api);
    let (addr, server) = spawn_api_server(
        api_config,
        report_router(ReportState {
            store: store.clone(),
            consumer: current_rx,
        }),
        cancel.clone(),
    )
    .await?;

    info!("consumer running, reports on http://{addr}/api/v1/stats");

    cancel.cancelled().await;

    with_grace(config.shutdown_grace(), async {
        let _ = supervisor.await;
        let _ = server.await;
    })
    .await;

    if let Err(e) = store.close().await {
        warn!("error closing store: {e}");
    }
    info!("consumer stopped");

    Ok(())
}
