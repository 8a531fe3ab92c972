use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::Deserialize;

use crate::api::AppState;
use crate::batch::repository::BatchRepository;
use crate::error::{AppError, AppResult};
use crate::ids::{InterviewerId, ResponseId, SurveyId, TenantId};
use crate::qc_config::repository::QcConfigRepository;
use crate::response::repository::ResponseRepository;
use crate::response::{Mode, Response, ResponseStatus};

#[derive(Deserialize)]
pub struct CreateResponseRequest {
    pub tenant_id: String,
    pub survey_id: String,
    pub interviewer_id: String,
    pub mode: String,
    pub selected_ac: Option<String>,
    #[serde(default = "serde_json::Value::default")]
    pub metadata: serde_json::Value,
}

/// `POST /responses` — interviewer-app submission intake. Not named in
/// spec.md §6's illustrative route list (mobile clients are out of scope
/// per spec.md §1), but `BatchingEngine::on_response_submitted` has no
/// other entry point, so this surface is what feeds it (see DESIGN.md).
#[tracing::instrument(skip(state, req))]
pub async fn create_response<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    Json(req): Json<CreateResponseRequest>,
) -> AppResult<(StatusCode, Json<serde_json::Value>)>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let mode = Mode::parse(&req.mode)
        .ok_or_else(|| AppError::Validation(format!("invalid mode: {}", req.mode)))?;

    let response = Response {
        id: ResponseId::new(),
        tenant_id: TenantId(req.tenant_id),
        survey_id: SurveyId(req.survey_id),
        interviewer_id: InterviewerId(req.interviewer_id),
        mode,
        selected_ac: req.selected_ac,
        created_at: crate::time::now(),
        status: ResponseStatus::Submitted,
        is_sample_response: false,
        batch_ref: None,
        verification: None,
        lease: None,
        last_skipped_at: None,
        metadata: req.metadata,
    };

    let stored = state
        .responses
        .mark_submitted(response)
        .await
        .map_err(AppError::Other)?;

    if let Err(e) = state.batching.on_response_submitted(&stored.id).await {
        tracing::warn!(response_id = %stored.id, error = %e, "batching failed for newly submitted response");
    }

    Ok((
        StatusCode::CREATED,
        Json(serde_json::json!({ "success": true, "data": stored })),
    ))
}
