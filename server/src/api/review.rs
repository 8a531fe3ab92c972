use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::api::{agent_id_header, ApiResponse, AppState, NoContent};
use crate::batch::repository::BatchRepository;
use crate::error::{AppError, AppResult};
use crate::ids::ResponseId;
use crate::qc_config::repository::QcConfigRepository;
use crate::response::repository::ResponseRepository;
use crate::response::{Mode, Response, Verdict};

#[derive(Deserialize)]
pub struct NextQuery {
    pub mode: Option<String>,
    pub exclude_response_id: Option<String>,
}

#[derive(Serialize)]
pub struct AssignmentDto {
    pub response: Response,
    pub expires_at: chrono::DateTime<chrono::Utc>,
}

/// `GET /review/next?mode=capi|cati&exclude_response_id=…` (spec.md §6).
#[tracing::instrument(skip(state, headers))]
pub async fn next_assignment<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: HeaderMap,
    Query(query): Query<NextQuery>,
) -> AppResult<ApiResponse<AssignmentDto>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let agent = agent_id_header(&headers)?;

    let mode = query
        .mode
        .as_deref()
        .map(|m| Mode::parse(m).ok_or_else(|| AppError::Validation(format!("invalid mode: {m}"))))
        .transpose()?;

    let exclude_response_id = query
        .exclude_response_id
        .as_deref()
        .map(|id| {
            id.parse::<uuid::Uuid>()
                .map(ResponseId)
                .map_err(|_| AppError::Validation(format!("invalid exclude_response_id: {id}")))
        })
        .transpose()?;

    let assignment = state
        .dispatcher
        .next_assignment(&agent, mode, exclude_response_id)
        .await?
        .ok_or_else(|| AppError::NotFound("no response currently available for review".into()))?;

    Ok(ApiResponse(AssignmentDto {
        response: assignment.response,
        expires_at: assignment.expires_at,
    }))
}

fn parse_response_id(raw: &str) -> AppResult<ResponseId> {
    raw.parse::<uuid::Uuid>()
        .map(ResponseId)
        .map_err(|_| AppError::Validation(format!("invalid response id: {raw}")))
}

/// `POST /review/:response_id/skip` (spec.md §6).
#[tracing::instrument(skip(state, headers))]
pub async fn skip<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: HeaderMap,
    Path(response_id): Path<String>,
) -> AppResult<NoContent>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let agent = agent_id_header(&headers)?;
    let response_id = parse_response_id(&response_id)?;
    state.dispatcher.skip_assignment(&agent, &response_id).await?;
    Ok(NoContent)
}

/// `POST /review/:response_id/release` (spec.md §6). Idempotent: a silent
/// no-op on an unknown or foreign lease.
#[tracing::instrument(skip(state, headers))]
pub async fn release<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: HeaderMap,
    Path(response_id): Path<String>,
) -> AppResult<NoContent>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let agent = agent_id_header(&headers)?;
    let response_id = parse_response_id(&response_id)?;
    state.dispatcher.release_assignment(&agent, &response_id).await?;
    Ok(NoContent)
}

#[derive(Deserialize)]
pub struct VerifyRequest {
    pub response_id: String,
    pub verdict: String,
    #[serde(default)]
    pub feedback: String,
}

/// `POST /review/verify` with `{response_id, verdict, feedback}` (spec.md
/// §6).
#[tracing::instrument(skip(state, headers, req), fields(response_id = %req.response_id))]
pub async fn verify<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: HeaderMap,
    Json(req): Json<VerifyRequest>,
) -> AppResult<NoContent>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let agent = agent_id_header(&headers)?;
    let response_id = parse_response_id(&req.response_id)?;
    let verdict = match req.verdict.as_str() {
        "approve" => Verdict::Approve,
        "reject" => Verdict::Reject,
        other => return Err(AppError::Validation(format!("invalid verdict: {other}"))),
    };

    state
        .verification
        .submit_verdict(&agent, &response_id, verdict, req.feedback)
        .await?;

    Ok(NoContent)
}
