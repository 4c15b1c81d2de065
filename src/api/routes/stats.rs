//! Statistics endpoint

use axum::{Json, extract::State};

use crate::api::{error::ApiResult, state::ReportState, types::StatsResponse};

/// GET /api/v1/stats
///
/// Consumer counters and store statistics
pub async fn get_stats(State(state): State<ReportState>) -> ApiResult<Json<StatsResponse>> {
    let store = state.store.get_stats().await?;

    let (consumer, consumer_state) = match state.consumer() {
        Some(handle) => (Some(handle.stats()), Some(handle.state())),
        None => (None, None),
    };

    Ok(Json(StatsResponse {
        timestamp: chrono::Utc::now().to_rfc3339(),
        consumer,
        consumer_state,
        store,
    }))
}
