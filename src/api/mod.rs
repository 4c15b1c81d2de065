//! HTTP surfaces of the pipeline
//!
//! ## Architecture
//!
//! - **Axum** web framework with Tower middleware
//! - **Shared handles** into the poll cycle, the consumer and the store
//!
//! ## Endpoints
//!
//! Trigger surface (aggregator):
//! - `GET /aggregate` - Run one poll cycle and return the batch
//! - `GET /api/v1/health` - Health check
//!
//! Report surface (consumer):
//! - `GET /api/v1/health` - Health check with consumer state
//! - `GET /api/v1/metrics` - Most recent metrics across sources
//! - `GET /api/v1/metrics/:source` - Metrics of one source
//! - `GET /api/v1/sources` - Sources with stored metrics
//! - `GET /api/v1/stats` - Consumer counters and store statistics

pub mod error;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod types;

pub use error::{ApiError, ApiResult};
pub use state::{ReportState, TriggerState};

use std::net::SocketAddr;

use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiSection;

/// API server configuration
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Bind address (e.g., "0.0.0.0:8080")
    pub bind_addr: SocketAddr,

    /// Optional authentication token
    pub auth_token: Option<String>,

    pub enable_cors: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
            auth_token: None,
            enable_cors: true,
        }
    }
}

impl From<&ApiSection> for ApiConfig {
    fn from(section: &ApiSection) -> Self {
        Self {
            bind_addr: section.bind,
            auth_token: section.token.clone(),
            enable_cors: section.cors,
        }
    }
}

/// Routes of the aggregator process
pub fn trigger_router(state: TriggerState) -> Router {
    Router::new()
        .route("/aggregate", get(routes::trigger::aggregate))
        .route("/api/v1/health", get(routes::health::liveness))
        .with_state(state)
}

/// Routes of the consumer process
pub fn report_router(state: ReportState) -> Router {
    Router::new()
        .route("/api/v1/health", get(routes::health::consumer_health))
        .route("/api/v1/metrics", get(routes::metrics::recent_metrics))
        .route("/api/v1/metrics/:source", get(routes::metrics::source_metrics))
        .route("/api/v1/sources", get(routes::metrics::list_sources))
        .route("/api/v1/stats", get(routes::stats::get_stats))
        .with_state(state)
}

/// Apply the configured layers to `router`
pub fn with_layers(config: &ApiConfig, router: Router) -> Router {
    let mut app = router.layer(TraceLayer::new_for_http());

    if config.enable_cors {
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
        app = app.layer(cors);
    }

    if let Some(token) = config.auth_token.clone() {
        app = app.layer(axum::middleware::from_fn_with_state(
            token,
            middleware::auth::auth_middleware,
        ));
    }

    app
}

/// Spawn the API server
///
/// Serves `router` with the configured layers in a background task until
/// `cancel` fires. Returns the bound address and the server task.
pub async fn spawn_api_server(
    config: ApiConfig,
    router: Router,
    cancel: CancellationToken,
) -> anyhow::Result<(SocketAddr, JoinHandle<()>)> {
    info!("starting API server on {}", config.bind_addr);

    let app = with_layers(&config, router);

    let listener = tokio::net::TcpListener::bind(config.bind_addr).await?;
    let addr = listener.local_addr()?;

    info!("API server listening on {}", addr);

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await
        {
            tracing::error!("API server error: {}", e);
        }
    });

    Ok((addr, server))
}
