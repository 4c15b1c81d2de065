use std::sync::Arc;

use clap::Parser;
use fleetpulse::actors::{PollCycle, SchedulerHandle};
use fleetpulse::api::{ApiConfig, TriggerState, spawn_api_server, trigger_router};
use fleetpulse::broker::DeliveryChannel;
use fleetpulse::broker::amqp::AmqpBroker;
use fleetpulse::config::read_config_file;
use fleetpulse::poller::{Aggregator, HttpProber, StaticDiscovery};
use fleetpulse::shutdown::{cancel_on_signal, with_grace};
use tokio_util::sync::CancellationToken;
use tracing::{info, level_filters::LevelFilter};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new().with_targets(vec![
        ("fleetpulse", LevelFilter::TRACE),
        ("fleetpulse_aggregator", LevelFilter::TRACE),
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
#[command(author, version, about = "Polls the node fleet and publishes batches")]
struct Args {
    #[arg(short)]
    file: String,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init();

    let Args { file } = Args::parse();
    let config = read_config_file(&file)?;
    let aggregator_config = &config.aggregator;

    let cancel = CancellationToken::new();
    cancel_on_signal(cancel.clone());

    let prober = HttpProber::new(aggregator_config.request_timeout())?;
    let discovery = StaticDiscovery::from_config(aggregator_config);
    let aggregator = Aggregator::new(Arc::new(prober), Arc::new(discovery))
        .with_cycle_deadline(aggregator_config.cycle_deadline());

    let broker = Arc::new(AmqpBroker::new(&config.broker));
    let delivery = DeliveryChannel::connect(
        broker,
        config.broker.queue_spec(),
        config.broker.retry,
        cancel.clone(),
    )
    .await?;

    let cycle = Arc::new(PollCycle::new(aggregator, delivery));
    let scheduler =
        SchedulerHandle::spawn(cycle.clone(), aggregator_config.interval(), cancel.clone());

    let api_config = ApiConfig::from(&aggregator_config.api);
    let (addr, server) = spawn_api_server(
        api_config,
        trigger_router(TriggerState {
            cycle: cycle.clone(),
        }),
        cancel.clone(),
    )
    .await?;

    info!(
        "aggregator running: {} node(s) every {}s, trigger on http://{addr}/aggregate",
        aggregator_config.nodes.len(),
        aggregator_config.interval_secs
    );

    cancel.cancelled().await;

    with_grace(config.shutdown_grace(), async {
        scheduler.stopped().await;
        let _ = server.await;
    })
    .await;

    cycle.delivery().close().await;
    info!("aggregator stopped");

    Ok(())
}
