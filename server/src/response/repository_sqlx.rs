use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};

use crate::db::{bool_to_i64, i64_to_bool, i64_to_opt_ts, i64_to_ts, ts_to_i64};
use crate::ids::{AgentId, BatchId, InterviewerId, ResponseId, SurveyId, TenantId};
use crate::response::repository::ResponseRepository;
use crate::response::{Mode, Response, ResponseStatus, Verdict, Verification};

pub struct SqlxResponseRepository {
    pool: AnyPool,
}

impl SqlxResponseRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ResponseRepository for SqlxResponseRepository {
    async fn mark_submitted(&self, response: Response) -> anyhow::Result<Response> {
        sqlx::query(
            r#"
INSERT INTO responses (
  response_id, tenant_id, survey_id, interviewer_id, mode, selected_ac, created_at,
  status, is_sample_response, batch_ref, batch_seq,
  verification_reviewer, verification_decided_at, verification_verdict,
  verification_feedback, verification_auto_approved, verification_auto_rejected,
  verification_batch_id,
  leased_to, leased_at, lease_expires_at, last_skipped_at, metadata
) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, NULL, ?);
"#,
        )
        .bind(response.id.to_string())
        .bind(&response.tenant_id.0)
        .bind(&response.survey_id.0)
        .bind(&response.interviewer_id.0)
        .bind(response.mode.as_str())
        .bind(response.selected_ac.clone())
        .bind(ts_to_i64(response.created_at)?)
        .bind(response.status.as_str())
        .bind(bool_to_i64(response.is_sample_response))
        .bind(response.metadata.to_string())
        .execute(&self.pool)
        .await?;

        Ok(response)
    }

    async fn fetch_by_id(&self, id: &ResponseId) -> anyhow::Result<Option<Response>> {
        let row = sqlx::query(SELECT_COLS_WHERE_ID)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(r) => Ok(Some(row_to_response(&r)?)),
            None => Ok(None),
        }
    }

    async fn fetch_by_survey(
        &self,
        survey_id: &SurveyId,
        mode: Option<Mode>,
        status: Option<ResponseStatus>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<Response>> {
        let mut sql = format!("{SELECT_COLS} FROM responses WHERE survey_id = ?");
        if mode.is_some() {
            sql.push_str(" AND mode = ?");
        }
        if status.is_some() {
            sql.push_str(" AND status = ?");
        }
        if since.is_some() {
            sql.push_str(" AND created_at >= ?");
        }
        sql.push_str(" ORDER BY created_at ASC LIMIT ?");

        let mut q = sqlx::query(&sql).bind(&survey_id.0);
        if let Some(m) = mode {
            q = q.bind(m.as_str());
        }
        if let Some(s) = status {
            q = q.bind(s.as_str());
        }
        if let Some(dt) = since {
            q = q.bind(ts_to_i64(dt)?);
        }
        q = q.bind(limit as i64);

        let rows = q.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_response(&r) {
                Ok(resp) => out.push(resp),
                Err(e) => tracing::warn!(error = %e, "skipping malformed response row"),
            }
        }
        Ok(out)
    }

    async fn attach_to_batch(&self, id: &ResponseId, batch_id: &BatchId) -> anyhow::Result<()> {
        // Idempotent: no-op if already attached to this batch; otherwise
        // attach with the next sequence number within the batch.
        let mut tx = self.pool.begin().await?;

        let current: Option<String> =
            sqlx::query_scalar("SELECT batch_ref FROM responses WHERE response_id = ?")
                .bind(id.to_string())
                .fetch_optional(&mut *tx)
                .await?
                .flatten();

        if current.as_deref() == Some(batch_id.to_string().as_str()) {
            tx.commit().await?;
            return Ok(());
        }

        let seq: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM responses WHERE batch_ref = ?")
                .bind(batch_id.to_string())
                .fetch_one(&mut *tx)
                .await?;

        sqlx::query(
            "UPDATE responses SET batch_ref = ?, batch_seq = ? WHERE response_id = ?",
        )
        .bind(batch_id.to_string())
        .bind(seq)
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_sample_or_remainder(
        &self,
        id: &ResponseId,
        is_sample: bool,
    ) -> anyhow::Result<()> {
        sqlx::query(
            r#"
UPDATE responses
SET is_sample_response = ?, status = ?
WHERE response_id = ?;
"#,
        )
        .bind(bool_to_i64(is_sample))
        .bind(ResponseStatus::PendingApproval.as_str())
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn approve(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool> {
        let res = apply_verdict(&self.pool, id, ResponseStatus::Approved, &verification).await?;
        Ok(res)
    }

    async fn reject(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool> {
        let res = apply_verdict(&self.pool, id, ResponseStatus::Rejected, &verification).await?;
        Ok(res)
    }

    async fn record_auto_decision(
        &self,
        ids: &[ResponseId],
        approved: bool,
        verification_template: Verification,
    ) -> anyhow::Result<u64> {
        let target_status = if approved {
            ResponseStatus::Approved
        } else {
            ResponseStatus::Rejected
        };

        let mut tx = self.pool.begin().await?;
        let mut affected = 0u64;

        for id in ids {
            let mut v = verification_template.clone();
            v.reviewer = None;
            let res = sqlx::query(
                r#"
UPDATE responses
SET status = ?, is_sample_response = 0,
    verification_reviewer = NULL,
    verification_decided_at = ?,
    verification_verdict = ?,
    verification_feedback = ?,
    verification_auto_approved = ?,
    verification_auto_rejected = ?,
    verification_batch_id = ?,
    leased_to = NULL, leased_at = NULL, lease_expires_at = NULL
WHERE response_id = ? AND status = ?;
"#,
            )
            .bind(target_status.as_str())
            .bind(ts_to_i64(v.decided_at)?)
            .bind(verdict_str(v.verdict))
            .bind(&v.feedback)
            .bind(bool_to_i64(v.auto_approved))
            .bind(bool_to_i64(v.auto_rejected))
            .bind(v.triggering_batch_id.to_string())
            .bind(id.to_string())
            .bind(ResponseStatus::PendingApproval.as_str())
            .execute(&mut *tx)
            .await?;

            affected += res.rows_affected();
        }

        tx.commit().await?;
        Ok(affected)
    }

    async fn try_acquire_lease(
        &self,
        id: &ResponseId,
        agent: &AgentId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE responses
SET leased_to = ?, leased_at = ?, lease_expires_at = ?
WHERE response_id = ?
  AND status = ?
  AND (leased_to IS NULL OR lease_expires_at <= ?);
"#,
        )
        .bind(&agent.0)
        .bind(ts_to_i64(now)?)
        .bind(ts_to_i64(expires_at)?)
        .bind(id.to_string())
        .bind(ResponseStatus::PendingApproval.as_str())
        .bind(ts_to_i64(now)?)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn release_lease(&self, id: &ResponseId, agent: &AgentId) -> anyhow::Result<()> {
        // Silent no-op on unknown/foreign lease, per spec.md §4.G.
        sqlx::query(
            r#"
UPDATE responses
SET leased_to = NULL, leased_at = NULL, lease_expires_at = NULL
WHERE response_id = ? AND leased_to = ?;
"#,
        )
        .bind(id.to_string())
        .bind(&agent.0)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn skip(
        &self,
        id: &ResponseId,
        agent: &AgentId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE responses
SET leased_to = NULL, leased_at = NULL, lease_expires_at = NULL, last_skipped_at = ?
WHERE response_id = ? AND leased_to = ?;
"#,
        )
        .bind(ts_to_i64(now)?)
        .bind(id.to_string())
        .bind(&agent.0)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn clear_expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<u64> {
        let res = sqlx::query(
            r#"
UPDATE responses
SET leased_to = NULL, leased_at = NULL, lease_expires_at = NULL
WHERE lease_expires_at IS NOT NULL AND lease_expires_at <= ?;
"#,
        )
        .bind(ts_to_i64(now)?)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected())
    }

    async fn fetch_dispatchable(
        &self,
        queued_for_qc_batches: &[BatchId],
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Response>> {
        let mut sql = format!(
            "{SELECT_COLS} FROM responses WHERE status = ? AND (is_sample_response = 1"
        );

        if !queued_for_qc_batches.is_empty() {
            let placeholders = vec!["?"; queued_for_qc_batches.len()].join(", ");
            sql.push_str(&format!(" OR batch_ref IN ({placeholders})"));
        }
        sql.push_str(") ORDER BY created_at ASC LIMIT ? OFFSET ?;");

        let mut q = sqlx::query(&sql).bind(ResponseStatus::PendingApproval.as_str());
        for b in queued_for_qc_batches {
            q = q.bind(b.to_string());
        }
        q = q.bind(limit as i64).bind(offset as i64);

        let rows = q.fetch_all(&self.pool).await?;
        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_response(&r) {
                Ok(resp) => out.push(resp),
                Err(e) => tracing::warn!(error = %e, "skipping malformed response row"),
            }
        }
        Ok(out)
    }

    async fn fetch_by_batch(&self, batch_id: &BatchId) -> anyhow::Result<Vec<Response>> {
        let sql = format!("{SELECT_COLS} FROM responses WHERE batch_ref = ? ORDER BY batch_seq ASC;");
        let rows = sqlx::query(&sql)
            .bind(batch_id.to_string())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_response(&r) {
                Ok(resp) => out.push(resp),
                Err(e) => tracing::warn!(error = %e, "skipping malformed response row"),
            }
        }
        Ok(out)
    }
}

async fn apply_verdict(
    pool: &AnyPool,
    id: &ResponseId,
    target_status: ResponseStatus,
    verification: &Verification,
) -> anyhow::Result<bool> {
    let res = sqlx::query(
        r#"
UPDATE responses
SET status = ?,
    verification_reviewer = ?,
    verification_decided_at = ?,
    verification_verdict = ?,
    verification_feedback = ?,
    verification_auto_approved = ?,
    verification_auto_rejected = ?,
    verification_batch_id = ?,
    leased_to = NULL, leased_at = NULL, lease_expires_at = NULL
WHERE response_id = ? AND status = ?;
"#,
    )
    .bind(target_status.as_str())
    .bind(verification.reviewer.as_ref().map(|a| a.0.clone()))
    .bind(ts_to_i64(verification.decided_at)?)
    .bind(verdict_str(verification.verdict))
    .bind(&verification.feedback)
    .bind(bool_to_i64(verification.auto_approved))
    .bind(bool_to_i64(verification.auto_rejected))
    .bind(verification.triggering_batch_id.to_string())
    .bind(id.to_string())
    .bind(ResponseStatus::PendingApproval.as_str())
    .execute(pool)
    .await?;

    Ok(res.rows_affected() == 1)
}

fn verdict_str(v: Verdict) -> &'static str {
    match v {
        Verdict::Approve => "approve",
        Verdict::Reject => "reject",
    }
}

fn parse_verdict(s: &str) -> anyhow::Result<Verdict> {
    match s {
        "approve" => Ok(Verdict::Approve),
        "reject" => Ok(Verdict::Reject),
        other => Err(anyhow!("unknown verdict: {other}")),
    }
}

const SELECT_COLS: &str = r#"SELECT
  response_id, tenant_id, survey_id, interviewer_id, mode, selected_ac, created_at,
  status, is_sample_response, batch_ref,
  verification_reviewer, verification_decided_at, verification_verdict,
  verification_feedback, verification_auto_approved, verification_auto_rejected,
  verification_batch_id,
  leased_to, leased_at, lease_expires_at, last_skipped_at, metadata"#;

const SELECT_COLS_WHERE_ID: &str = r#"SELECT
  response_id, tenant_id, survey_id, interviewer_id, mode, selected_ac, created_at,
  status, is_sample_response, batch_ref,
  verification_reviewer, verification_decided_at, verification_verdict,
  verification_feedback, verification_auto_approved, verification_auto_rejected,
  verification_batch_id,
  leased_to, leased_at, lease_expires_at, last_skipped_at, metadata
FROM responses WHERE response_id = ?"#;

fn row_to_response(r: &sqlx::any::AnyRow) -> anyhow::Result<Response> {
    let id_str: String = r.get("response_id");
    let id = ResponseId(
        uuid::Uuid::parse_str(&id_str).context("invalid response_id")?,
    );

    let status_str: String = r.get("status");
    let status = ResponseStatus::parse(&status_str)
        .ok_or_else(|| anyhow!("unknown response status: {status_str}"))?;

    let mode_str: String = r.get("mode");
    let mode = Mode::parse(&mode_str).ok_or_else(|| anyhow!("unknown mode: {mode_str}"))?;

    let batch_ref: Option<String> = r.get("batch_ref");
    let batch_ref = batch_ref
        .map(|s| uuid::Uuid::parse_str(&s).map(BatchId))
        .transpose()
        .context("invalid batch_ref")?;

    let verification_verdict: Option<String> = r.get("verification_verdict");
    let verification = if let Some(verdict_str) = verification_verdict {
        let reviewer: Option<String> = r.get("verification_reviewer");
        let decided_at: i64 = r
            .try_get("verification_decided_at")
            .context("missing verification_decided_at")?;
        let batch_id_str: String = r
            .try_get("verification_batch_id")
            .context("missing verification_batch_id")?;

        Some(Verification {
            reviewer: reviewer.map(AgentId),
            decided_at: i64_to_ts(decided_at)?,
            verdict: parse_verdict(&verdict_str)?,
            feedback: r.get::<Option<String>, _>("verification_feedback").unwrap_or_default(),
            auto_approved: i64_to_bool(r.get::<Option<i64>, _>("verification_auto_approved").unwrap_or(0)),
            auto_rejected: i64_to_bool(r.get::<Option<i64>, _>("verification_auto_rejected").unwrap_or(0)),
            triggering_batch_id: BatchId(
                uuid::Uuid::parse_str(&batch_id_str).context("invalid verification batch id")?,
            ),
        })
    } else {
        None
    };

    let leased_to: Option<String> = r.get("leased_to");
    let lease = if let Some(leased_to) = leased_to {
        let leased_at: i64 = r.try_get("leased_at").context("missing leased_at")?;
        let expires_at: i64 = r
            .try_get("lease_expires_at")
            .context("missing lease_expires_at")?;
        Some(crate::response::Lease {
            leased_to: AgentId(leased_to),
            leased_at: i64_to_ts(leased_at)?,
            expires_at: i64_to_ts(expires_at)?,
        })
    } else {
        None
    };

    let last_skipped_at: Option<i64> = r.get("last_skipped_at");
    let metadata_str: String = r.get("metadata");

    Ok(Response {
        id,
        tenant_id: TenantId(r.get("tenant_id")),
        survey_id: SurveyId(r.get("survey_id")),
        interviewer_id: InterviewerId(r.get("interviewer_id")),
        mode,
        selected_ac: r.get("selected_ac"),
        created_at: i64_to_ts(r.get("created_at"))?,
        status,
        is_sample_response: i64_to_bool(r.get("is_sample_response")),
        batch_ref,
        verification,
        lease,
        last_skipped_at: i64_to_opt_ts(last_skipped_at)?,
        metadata: serde_json::from_str(&metadata_str).unwrap_or(serde_json::Value::Null),
    })
}
