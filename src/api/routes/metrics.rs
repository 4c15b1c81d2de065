//! Persisted metric endpoints

use axum::{
    Json,
    extract::{Path, Query, State},
};
use chrono::{Duration, Utc};

use crate::api::{
    error::{ApiError, ApiResult},
    state::ReportState,
    types::{MetricQuery, MetricsResponse, SourcesResponse},
};
use crate::storage::QueryRange;

/// GET /api/v1/metrics?limit=
///
/// Most recent metrics across all sources, oldest first
pub async fn recent_metrics(
    State(state): State<ReportState>,
    Query(query): Query<MetricQuery>,
) -> ApiResult<Json<MetricsResponse>> {
    let metrics = state.store.query_recent(query.limit()).await?;
    Ok(Json(metrics.into()))
}

/// GET /api/v1/metrics/:source?start=&end=&limit=
///
/// Latest metrics of one source, or a time range when `start` or `end` is
/// given (default range: the hour before `end`).
pub async fn source_metrics(
    State(state): State<ReportState>,
    Path(source): Path<String>,
    Query(query): Query<MetricQuery>,
) -> ApiResult<Json<MetricsResponse>> {
    let metrics = if query.start.is_none() && query.end.is_none() {
        state.store.query_latest(&source, query.limit()).await?
    } else {
        let end = query.end.unwrap_or_else(Utc::now);
        let start = query.start.unwrap_or(end - Duration::hours(1));

        if start > end {
            return Err(ApiError::InvalidRequest(
                "start must not be after end".to_string(),
            ));
        }

        state
            .store
            .query_range(QueryRange {
                source: source.clone(),
                start,
                end,
                limit: Some(query.limit()),
            })
            .await?
    };

    if metrics.is_empty() {
        return Err(ApiError::NotFound(format!(
            "no metrics for source '{source}'"
        )));
    }

    Ok(Json(metrics.into()))
}

/// GET /api/v1/sources
pub async fn list_sources(State(state): State<ReportState>) -> ApiResult<Json<SourcesResponse>> {
    let sources = state.store.list_sources().await?;

    Ok(Json(SourcesResponse {
        count: sources.len(),
        sources,
    }))
}
