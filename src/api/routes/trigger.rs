//! On-demand poll trigger

use axum::{Json, extract::State};

use crate::Batch;
use crate::actors::CycleReport;
use crate::api::{
    error::{ApiError, ApiResult},
    state::TriggerState,
};

/// GET /aggregate
///
/// Runs one poll cycle independently of the timer. Responds with the
/// published batch, 500 when no node answered and 503 when the batch could
/// not be handed to the broker.
pub async fn aggregate(State(state): State<TriggerState>) -> ApiResult<Json<Batch>> {
    match state.cycle.run().await? {
        CycleReport::Published(batch) => Ok(Json(batch)),
        CycleReport::Empty(_) => Err(ApiError::NoValidResponses),
        CycleReport::PublishFailed { error, .. } => Err(ApiError::Unavailable(format!(
            "failed to publish batch: {error}"
        ))),
    }
}
