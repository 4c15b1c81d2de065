//! Health check endpoints

use axum::{Json, extract::State};

use crate::actors::ConsumerState;
use crate::api::{state::ReportState, types::HealthResponse};

/// GET /api/v1/health (aggregator)
pub async fn liveness() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        consumer: None,
        storage: None,
    })
}

/// GET /api/v1/health (consumer)
///
/// Always 200; `status` is `degraded` unless the consumer is subscribed and
/// the store is healthy.
pub async fn consumer_health(State(state): State<ReportState>) -> Json<HealthResponse> {
    let consumer = state.consumer().map(|handle| handle.state());
    let storage = state.store.health_check().await.ok();

    let healthy = matches!(
        consumer,
        Some(ConsumerState::Subscribed | ConsumerState::Processing)
    ) && storage.as_ref().is_some_and(|s| s.healthy);

    Json(HealthResponse {
        status: if healthy { "ok" } else { "degraded" }.to_string(),
        timestamp: chrono::Utc::now().to_rfc3339(),
        consumer: Some(consumer.unwrap_or(ConsumerState::Disconnected)),
        storage,
    })
}
