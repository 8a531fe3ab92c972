use axum::extract::{Path, Query, State};
use serde::Deserialize;

use crate::api::{ApiResponse, AppState};
use crate::batch::repository::BatchRepository;
use crate::batch::{Batch, BatchStatus};
use crate::error::{AppError, AppResult};
use crate::ids::{BatchId, SurveyId};
use crate::qc_config::repository::QcConfigRepository;
use crate::response::repository::ResponseRepository;

const DEFAULT_LIST_LIMIT: usize = 50;

#[derive(Deserialize)]
pub struct ListBatchesQuery {
    pub survey: String,
    pub limit: Option<usize>,
    pub offset: Option<usize>,
}

/// `GET /batches?survey=…` — list with per-batch live stats (spec.md §6).
/// `stats` already lives on `Batch` so no extra join is needed.
#[tracing::instrument(skip(state))]
pub async fn list_batches<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    Query(query): Query<ListBatchesQuery>,
) -> AppResult<ApiResponse<Vec<Batch>>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let survey_id = SurveyId(query.survey);
    let batches = state
        .batches
        .fetch_by_survey(
            &survey_id,
            query.limit.unwrap_or(DEFAULT_LIST_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await
        .map_err(AppError::Other)?;

    Ok(ApiResponse(batches))
}

fn parse_batch_id(raw: &str) -> AppResult<BatchId> {
    raw.parse::<uuid::Uuid>()
        .map(BatchId)
        .map_err(|_| AppError::Validation(format!("invalid batch id: {raw}")))
}

/// `GET /batches/:id` — full detail including sample/remainder ids
/// (spec.md §6). The sample/remainder split lives on the individual
/// responses (`is_sample_response`), fetched alongside the batch.
#[tracing::instrument(skip(state))]
pub async fn get_batch<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<serde_json::Value>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let batch_id = parse_batch_id(&id)?;
    let batch = state
        .batches
        .fetch_by_id(&batch_id)
        .await
        .map_err(AppError::Other)?
        .ok_or_else(|| AppError::NotFound(format!("batch {batch_id} not found")))?;

    let members = state
        .responses
        .fetch_by_batch(&batch_id)
        .await
        .map_err(AppError::Other)?;

    let (sample, remainder): (Vec<_>, Vec<_>) =
        members.iter().partition(|r| r.is_sample_response);

    Ok(ApiResponse(serde_json::json!({
        "batch": batch,
        "sample_response_ids": sample.iter().map(|r| r.id).collect::<Vec<_>>(),
        "remainder_response_ids": remainder.iter().map(|r| r.id).collect::<Vec<_>>(),
    })))
}

/// `POST /batches/:id/seal` — manual seal, ahead of the daily clock;
/// requires the batch to be `collecting` with at least one response
/// (spec.md §6).
#[tracing::instrument(skip(state))]
pub async fn seal_batch<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<serde_json::Value>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let batch_id = parse_batch_id(&id)?;
    let batch = state
        .batches
        .fetch_by_id(&batch_id)
        .await
        .map_err(AppError::Other)?
        .ok_or_else(|| AppError::NotFound(format!("batch {batch_id} not found")))?;

    if batch.status != BatchStatus::Collecting {
        return Err(AppError::Validation(format!(
            "batch {batch_id} is not collecting (status {:?})",
            batch.status
        )));
    }
    if batch.total_responses == 0 {
        return Err(AppError::Validation(format!(
            "batch {batch_id} has no responses to seal"
        )));
    }

    state
        .sampling
        .seal_batch(&batch_id)
        .await
        .map_err(AppError::Other)?;

    Ok(ApiResponse(serde_json::json!({ "sealed": true })))
}

/// `POST /batches/process` — triggers the scheduler's daily seal and
/// remainder evaluation immediately, out of band from its regular
/// cadence (spec.md §6).
#[tracing::instrument(skip(state))]
pub async fn process_batches<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
) -> AppResult<ApiResponse<serde_json::Value>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let today = crate::time::logical_day(&state.config.daily_seal_tz);
    let stale = state
        .batches
        .fetch_collecting_before(&today)
        .await
        .map_err(AppError::Other)?;

    for batch in &stale {
        if let Err(e) = state.sampling.seal_batch(&batch.id).await {
            tracing::warn!(batch_id = %batch.id, error = %e, "manual seal trigger failed for batch");
        }
    }

    let in_progress = state
        .batches
        .fetch_all_qc_in_progress()
        .await
        .map_err(AppError::Other)?;

    let mut surveys = std::collections::HashSet::new();
    for batch in &in_progress {
        surveys.insert(batch.survey_id.clone());
    }
    for survey_id in &surveys {
        if let Err(e) = state.sampling.evaluate_all_pending(survey_id).await {
            tracing::warn!(survey_id = %survey_id, error = %e, "manual evaluation trigger failed for survey");
        }
    }

    Ok(ApiResponse(serde_json::json!({
        "sealed": stale.len(),
        "surveys_evaluated": surveys.len(),
    })))
}
