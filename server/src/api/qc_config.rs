use axum::extract::{Path, State};
use axum::Json;
use serde::Deserialize;

use crate::api::{ApiResponse, AppState};
use crate::batch::repository::BatchRepository;
use crate::error::{AppError, AppResult};
use crate::ids::{ConfigId, SurveyId, TenantId};
use crate::qc_config::repository::QcConfigRepository;
use crate::qc_config::{Action, ApprovalRule, QcConfig};
use crate::response::repository::ResponseRepository;

/// `GET /qc-config/survey/:id` — resolves the active config for a survey
/// (spec.md §6), falling back to the tenant-wide default exactly as
/// `ConfigResolver::resolve` does on the batching hot path. The tenant is
/// carried via the `x-tenant-id` header since this surface, like every
/// other route, is authenticated/authorized externally.
#[tracing::instrument(skip(state, headers))]
pub async fn fetch_for_survey<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: axum::http::HeaderMap,
    Path(id): Path<String>,
) -> AppResult<ApiResponse<Option<QcConfig>>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| TenantId(s.to_string()))
        .ok_or_else(|| AppError::Validation("missing x-tenant-id header".into()))?;

    let survey_id = SurveyId(id);
    let config = state
        .config_resolver
        .resolve(&tenant_id, &survey_id)
        .await
        .map_err(AppError::Other)?;

    Ok(ApiResponse(config))
}

#[derive(Deserialize)]
pub struct ApprovalRuleDto {
    pub min_rate: f64,
    pub max_rate: f64,
    pub action: String,
}

#[derive(Deserialize)]
pub struct CreateConfigRequest {
    pub survey_id: Option<String>,
    pub sample_percentage: u8,
    pub approval_rules: Vec<ApprovalRuleDto>,
    pub notes: Option<String>,
}

/// `POST /qc-config` with `{survey_id?, sample_percentage, approval_rules,
/// notes}` (spec.md §6): validates the invariants in spec.md §3, then
/// deactivates the previously-active config for the same `(tenant,
/// survey)` key before inserting the new one as active — `upsert` itself
/// is a single-row operation, so this three-step choreography is the
/// handler's responsibility, not the repository's.
#[tracing::instrument(skip(state, headers, req))]
pub async fn create_config<RR, BR, CR>(
    State(state): State<AppState<RR, BR, CR>>,
    headers: axum::http::HeaderMap,
    Json(req): Json<CreateConfigRequest>,
) -> AppResult<ApiResponse<QcConfig>>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    let tenant_id = headers
        .get("x-tenant-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| TenantId(s.to_string()))
        .ok_or_else(|| AppError::Validation("missing x-tenant-id header".into()))?;

    let survey_id = req.survey_id.map(SurveyId);

    let mut approval_rules = Vec::with_capacity(req.approval_rules.len());
    for rule in req.approval_rules {
        let action = Action::parse(&rule.action)
            .ok_or_else(|| AppError::Validation(format!("invalid action: {}", rule.action)))?;
        approval_rules.push(ApprovalRule {
            min_rate: rule.min_rate,
            max_rate: rule.max_rate,
            action,
        });
    }

    let config = QcConfig {
        id: ConfigId::new(),
        tenant_id: tenant_id.clone(),
        survey_id: survey_id.clone(),
        active: true,
        sample_percentage: req.sample_percentage,
        approval_rules,
        notes: req.notes,
        created_at: crate::time::now(),
    };

    config
        .validate()
        .map_err(AppError::Validation)?;

    let previous = match &survey_id {
        Some(sid) => state.qc_configs.fetch_active_for_survey(&tenant_id, sid).await,
        None => state.qc_configs.fetch_active_default(&tenant_id).await,
    }
    .map_err(AppError::Other)?;

    if let Some(previous) = previous {
        state
            .qc_configs
            .deactivate(&previous.id)
            .await
            .map_err(AppError::Other)?;
    }

    let created = state.qc_configs.upsert(config).await.map_err(AppError::Other)?;
    state.config_resolver.invalidate_tenant(&tenant_id);

    Ok(ApiResponse(created))
}
