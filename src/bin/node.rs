use fleetpulse::util::{get_addr, get_port, usage_to_status};
use rocket::{figment::Figment, get, launch, routes};
use sysinfo::System;
use tracing::{debug, instrument};
use tracing_subscriber::{filter, layer::SubscriberExt, util::SubscriberInitExt};

/// Average CPU usage over one sampling window, as a bare integer body
#[get("/status")]
#[instrument]
async fn status() -> String {
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    rocket::tokio::time::sleep(sysinfo::MINIMUM_CPU_UPDATE_INTERVAL).await;
    sys.refresh_cpu_usage();

    let cpus = sys.cpus();
    let usage = if cpus.is_empty() {
        0.0
    } else {
        cpus.iter().map(|cpu| cpu.cpu_usage()).sum::<f32>() / cpus.len() as f32
    };

    let value = usage_to_status(usage);
    debug!("reporting status {value} ({usage:.2}% over {} cpus)", cpus.len());

    value.to_string()
}

#[get("/ping")]
fn ping() {}

fn init() {
    dotenv::dotenv().ok();

    let filter = filter::Targets::new()
        .with_target("fleetpulse", tracing::metadata::LevelFilter::TRACE)
        .with_target("fleetpulse_node", tracing::metadata::LevelFilter::TRACE);
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

fn get_config() -> Figment {
    rocket::Config::figment()
        .merge(("port", get_port()))
        .merge(("address", get_addr()))
        .merge(("workers", 1))
}

#[launch]
fn rocket() -> _ {
    init();
    let figment = get_config();

    rocket::custom(figment).mount("/", routes![status, ping])
}
