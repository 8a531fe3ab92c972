use anyhow::Context;
use async_trait::async_trait;
use sqlx::{AnyPool, Row};

use crate::db::{bool_to_i64, i64_to_bool, i64_to_ts, i64_to_u8, ts_to_i64, u8_to_i64};
use crate::ids::{ConfigId, SurveyId, TenantId};
use crate::qc_config::repository::QcConfigRepository;
use crate::qc_config::QcConfig;

pub struct SqlxQcConfigRepository {
    pool: AnyPool,
}

impl SqlxQcConfigRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QcConfigRepository for SqlxQcConfigRepository {
    async fn upsert(&self, config: QcConfig) -> anyhow::Result<QcConfig> {
        sqlx::query(
            r#"
INSERT INTO qc_configs (
  config_id, tenant_id, survey_id, active, sample_percentage, approval_rules,
  notes, created_at
) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
ON CONFLICT(config_id) DO UPDATE SET
  active = excluded.active,
  sample_percentage = excluded.sample_percentage,
  approval_rules = excluded.approval_rules,
  notes = excluded.notes;
"#,
        )
        .bind(config.id.to_string())
        .bind(&config.tenant_id.0)
        .bind(config.survey_id.as_ref().map(|s| s.0.clone()))
        .bind(bool_to_i64(config.active))
        .bind(u8_to_i64(config.sample_percentage))
        .bind(serde_json::to_string(&config.approval_rules)?)
        .bind(&config.notes)
        .bind(ts_to_i64(config.created_at)?)
        .execute(&self.pool)
        .await?;

        Ok(config)
    }

    async fn fetch_by_id(&self, id: &ConfigId) -> anyhow::Result<Option<QcConfig>> {
        let row = sqlx::query(&format!("{SELECT_COLS} FROM qc_configs WHERE config_id = ?"))
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_config(&r)).transpose()
    }

    async fn fetch_active_for_survey(
        &self,
        tenant_id: &TenantId,
        survey_id: &SurveyId,
    ) -> anyhow::Result<Option<QcConfig>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLS} FROM qc_configs WHERE tenant_id = ? AND survey_id = ? AND active = 1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(&tenant_id.0)
        .bind(&survey_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_config(&r)).transpose()
    }

    async fn fetch_active_default(&self, tenant_id: &TenantId) -> anyhow::Result<Option<QcConfig>> {
        let row = sqlx::query(&format!(
            "{SELECT_COLS} FROM qc_configs WHERE tenant_id = ? AND survey_id IS NULL AND active = 1 ORDER BY created_at DESC LIMIT 1"
        ))
        .bind(&tenant_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| row_to_config(&r)).transpose()
    }

    async fn deactivate(&self, id: &ConfigId) -> anyhow::Result<()> {
        sqlx::query("UPDATE qc_configs SET active = 0 WHERE config_id = ?;")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

const SELECT_COLS: &str = r#"SELECT
  config_id, tenant_id, survey_id, active, sample_percentage, approval_rules,
  notes, created_at"#;

fn row_to_config(r: &sqlx::any::AnyRow) -> anyhow::Result<QcConfig> {
    let id_str: String = r.get("config_id");
    let id = ConfigId(uuid::Uuid::parse_str(&id_str).context("invalid config_id")?);

    let survey_id: Option<String> = r.get("survey_id");
    let rules_str: String = r.get("approval_rules");

    Ok(QcConfig {
        id,
        tenant_id: TenantId(r.get("tenant_id")),
        survey_id: survey_id.map(SurveyId),
        active: i64_to_bool(r.get("active")),
        sample_percentage: i64_to_u8(r.get("sample_percentage"))?,
        approval_rules: serde_json::from_str(&rules_str)
            .context("corrupt approval_rules json")?,
        notes: r.get("notes"),
        created_at: i64_to_ts(r.get("created_at"))?,
    })
}
