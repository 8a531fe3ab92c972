use async_trait::async_trait;

use crate::ids::{ConfigId, SurveyId, TenantId};
use crate::qc_config::QcConfig;

/// Persistence boundary for Quality Control Configs (component C,
/// spec.md §4.C).
#[async_trait]
pub trait QcConfigRepository: Send + Sync {
    async fn upsert(&self, config: QcConfig) -> anyhow::Result<QcConfig>;

    async fn fetch_by_id(&self, id: &ConfigId) -> anyhow::Result<Option<QcConfig>>;

    /// The active survey-specific config for `(tenant, survey)`, if any.
    async fn fetch_active_for_survey(
        &self,
        tenant_id: &TenantId,
        survey_id: &SurveyId,
    ) -> anyhow::Result<Option<QcConfig>>;

    /// The active tenant-wide default config (`survey_id IS NULL`).
    async fn fetch_active_default(&self, tenant_id: &TenantId) -> anyhow::Result<Option<QcConfig>>;

    async fn deactivate(&self, id: &ConfigId) -> anyhow::Result<()>;
}
