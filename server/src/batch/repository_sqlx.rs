use anyhow::{Context, anyhow};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{AnyPool, Row};

use crate::batch::repository::BatchRepository;
use crate::batch::{Batch, BatchConfigSnapshot, BatchStatus, QcStats, RemainderDecision};
use crate::db::{i64_to_opt_ts, i64_to_ts, ts_to_i64, u8_to_i64};
use crate::ids::{BatchId, InterviewerId, SurveyId, TenantId};

pub struct SqlxBatchRepository {
    pool: AnyPool,
}

impl SqlxBatchRepository {
    pub fn new(pool: AnyPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchRepository for SqlxBatchRepository {
    async fn find_or_create_collecting(
        &self,
        tenant_id: &TenantId,
        survey_id: &SurveyId,
        interviewer_id: &InterviewerId,
        batch_date: &str,
        config_snapshot: BatchConfigSnapshot,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Batch> {
        let mut tx = self.pool.begin().await?;

        let existing = sqlx::query(SELECT_COLS_BY_KEY)
            .bind(&survey_id.0)
            .bind(&interviewer_id.0)
            .bind(BatchStatus::Collecting.as_str())
            .fetch_optional(&mut *tx)
            .await?;

        if let Some(row) = existing {
            let batch = row_to_batch(&row)?;
            tx.commit().await?;
            return Ok(batch);
        }

        let batch = Batch {
            id: BatchId::new(),
            tenant_id: tenant_id.clone(),
            survey_id: survey_id.clone(),
            interviewer_id: interviewer_id.clone(),
            batch_date: batch_date.to_string(),
            status: BatchStatus::Collecting,
            total_responses: 0,
            config_snapshot: Some(config_snapshot.clone()),
            stats: QcStats::default(),
            remainder_decision: RemainderDecision::Pending,
            remainder_decided_at: None,
            remainder_trigger_rate: None,
            processing_started_at: None,
            created_at: now,
            version: 0,
        };

        let insert_res = sqlx::query(
            r#"
INSERT INTO batches (
  batch_id, survey_id, interviewer_id, tenant_id, batch_date,
  status, total_responses, sample_percentage, approval_rules,
  approved_count, rejected_count, pending_count, approval_rate,
  remainder_decision, remainder_decided_at, remainder_trigger_rate,
  processing_started_at, created_at, version
) SELECT ?, ?, ?, ?, ?, ?, 0, ?, ?, 0, 0, 0, 0, ?, NULL, NULL, NULL, ?, 0
WHERE NOT EXISTS (
  SELECT 1 FROM batches
  WHERE survey_id = ? AND interviewer_id = ? AND status = ?
);
"#,
        )
        .bind(batch.id.to_string())
        .bind(&survey_id.0)
        .bind(&interviewer_id.0)
        .bind(&tenant_id.0)
        .bind(batch_date)
        .bind(BatchStatus::Collecting.as_str())
        .bind(u8_to_i64(config_snapshot.sample_percentage))
        .bind(serde_json::to_string(&config_snapshot)?)
        .bind(RemainderDecision::Pending.as_str())
        .bind(ts_to_i64(now)?)
        .bind(&survey_id.0)
        .bind(&interviewer_id.0)
        .bind(BatchStatus::Collecting.as_str())
        .execute(&mut *tx)
        .await;

        // `idx_batches_one_collecting` can still fire here under true
        // concurrent inserts (both transactions saw `NOT EXISTS` as true
        // under snapshot isolation); that is the race losing, not a bug.
        let inserted = match insert_res {
            Ok(r) => r.rows_affected() == 1,
            Err(sqlx::Error::Database(_)) => false,
            Err(e) => return Err(e.into()),
        };

        if inserted {
            tx.commit().await?;
            return Ok(batch);
        }
        tx.rollback().await?;

        // Lost the race: someone else inserted between our SELECT and
        // INSERT. Re-read the row they created.
        let row = sqlx::query(SELECT_COLS_BY_KEY)
            .bind(&survey_id.0)
            .bind(&interviewer_id.0)
            .bind(BatchStatus::Collecting.as_str())
            .fetch_one(&self.pool)
            .await?;
        row_to_batch(&row)
    }

    async fn fetch_by_id(&self, id: &BatchId) -> anyhow::Result<Option<Batch>> {
        let row = sqlx::query(SELECT_COLS_BY_ID)
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;

        row.map(|r| row_to_batch(&r)).transpose()
    }

    async fn append_response(
        &self,
        id: &BatchId,
        expected_version: i64,
        capacity: i64,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE batches
SET total_responses = total_responses + 1, version = version + 1
WHERE batch_id = ? AND version = ? AND status = ? AND total_responses < ?;
"#,
        )
        .bind(id.to_string())
        .bind(expected_version)
        .bind(BatchStatus::Collecting.as_str())
        .bind(capacity)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn seal(
        &self,
        id: &BatchId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE batches
SET status = ?, processing_started_at = ?, version = version + 1
WHERE batch_id = ? AND version = ? AND status = ?;
"#,
        )
        .bind(BatchStatus::QcInProgress.as_str())
        .bind(ts_to_i64(now)?)
        .bind(id.to_string())
        .bind(expected_version)
        .bind(BatchStatus::Collecting.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn update_stats(
        &self,
        id: &BatchId,
        expected_version: i64,
        stats: QcStats,
    ) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE batches
SET approved_count = ?, rejected_count = ?, pending_count = ?, approval_rate = ?,
    version = version + 1
WHERE batch_id = ? AND version = ?;
"#,
        )
        .bind(stats.approved_count as i64)
        .bind(stats.rejected_count as i64)
        .bind(stats.pending_count as i64)
        .bind(stats.approval_rate)
        .bind(id.to_string())
        .bind(expected_version)
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn set_remainder_decision(
        &self,
        id: &BatchId,
        expected_version: i64,
        decision: RemainderDecision,
        trigger_rate: Option<f64>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool> {
        let next_status = match decision {
            RemainderDecision::AutoApprove => BatchStatus::AutoApproved,
            RemainderDecision::SendToQc => BatchStatus::QueuedForQc,
            // reject_all resolves the batch immediately: the sample is
            // already fully adjudicated (a precondition of reaching this
            // evaluation) and the remainder is rejected in the same
            // transaction boundary, so no further human review applies.
            RemainderDecision::RejectAll => BatchStatus::Completed,
            RemainderDecision::Pending => BatchStatus::QcInProgress,
        };

        let res = sqlx::query(
            r#"
UPDATE batches
SET remainder_decision = ?, remainder_decided_at = ?, remainder_trigger_rate = ?,
    status = ?, version = version + 1
WHERE batch_id = ? AND version = ? AND status = ?;
"#,
        )
        .bind(decision.as_str())
        .bind(ts_to_i64(now)?)
        .bind(trigger_rate)
        .bind(next_status.as_str())
        .bind(id.to_string())
        .bind(expected_version)
        .bind(BatchStatus::QcInProgress.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn finalize(&self, id: &BatchId, expected_version: i64) -> anyhow::Result<bool> {
        let res = sqlx::query(
            r#"
UPDATE batches
SET status = ?, version = version + 1
WHERE batch_id = ? AND version = ? AND status IN (?, ?);
"#,
        )
        .bind(BatchStatus::Completed.as_str())
        .bind(id.to_string())
        .bind(expected_version)
        .bind(BatchStatus::AutoApproved.as_str())
        .bind(BatchStatus::QueuedForQc.as_str())
        .execute(&self.pool)
        .await?;

        Ok(res.rows_affected() == 1)
    }

    async fn fetch_collecting_before(&self, cutoff_date: &str) -> anyhow::Result<Vec<Batch>> {
        let sql = format!("{SELECT_COLS} FROM batches WHERE status = ? AND batch_date < ?;");
        let rows = sqlx::query(&sql)
            .bind(BatchStatus::Collecting.as_str())
            .bind(cutoff_date)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_batch(&r) {
                Ok(b) => out.push(b),
                Err(e) => tracing::warn!(error = %e, "skipping malformed batch row"),
            }
        }
        Ok(out)
    }

    async fn fetch_qc_in_progress_for_survey(
        &self,
        survey_id: &SurveyId,
    ) -> anyhow::Result<Vec<Batch>> {
        let sql = format!("{SELECT_COLS} FROM batches WHERE status = ? AND survey_id = ?;");
        let rows = sqlx::query(&sql)
            .bind(BatchStatus::QcInProgress.as_str())
            .bind(&survey_id.0)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_batch(&r) {
                Ok(b) => out.push(b),
                Err(e) => tracing::warn!(error = %e, "skipping malformed batch row"),
            }
        }
        Ok(out)
    }

    async fn fetch_by_survey(
        &self,
        survey_id: &SurveyId,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Batch>> {
        let sql = format!(
            "{SELECT_COLS} FROM batches WHERE survey_id = ? ORDER BY created_at DESC LIMIT ? OFFSET ?;"
        );
        let rows = sqlx::query(&sql)
            .bind(&survey_id.0)
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_batch(&r) {
                Ok(b) => out.push(b),
                Err(e) => tracing::warn!(error = %e, "skipping malformed batch row"),
            }
        }
        Ok(out)
    }

    async fn fetch_all_qc_in_progress(&self) -> anyhow::Result<Vec<Batch>> {
        let sql = format!("{SELECT_COLS} FROM batches WHERE status = ?;");
        let rows = sqlx::query(&sql)
            .bind(BatchStatus::QcInProgress.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            match row_to_batch(&r) {
                Ok(b) => out.push(b),
                Err(e) => tracing::warn!(error = %e, "skipping malformed batch row"),
            }
        }
        Ok(out)
    }

    async fn fetch_queued_for_qc_ids(&self) -> anyhow::Result<Vec<BatchId>> {
        let rows = sqlx::query("SELECT batch_id FROM batches WHERE status = ?;")
            .bind(BatchStatus::QueuedForQc.as_str())
            .fetch_all(&self.pool)
            .await?;

        let mut out = Vec::with_capacity(rows.len());
        for r in rows {
            let id_str: String = r.get("batch_id");
            match uuid::Uuid::parse_str(&id_str) {
                Ok(u) => out.push(BatchId(u)),
                Err(e) => tracing::warn!(error = %e, "skipping malformed batch_id"),
            }
        }
        Ok(out)
    }
}

const SELECT_COLS: &str = r#"SELECT
  batch_id, survey_id, interviewer_id, tenant_id, batch_date,
  status, total_responses, sample_percentage, approval_rules,
  approved_count, rejected_count, pending_count, approval_rate,
  remainder_decision, remainder_decided_at, remainder_trigger_rate,
  processing_started_at, created_at, version"#;

const SELECT_COLS_BY_ID: &str = r#"SELECT
  batch_id, survey_id, interviewer_id, tenant_id, batch_date,
  status, total_responses, sample_percentage, approval_rules,
  approved_count, rejected_count, pending_count, approval_rate,
  remainder_decision, remainder_decided_at, remainder_trigger_rate,
  processing_started_at, created_at, version
FROM batches WHERE batch_id = ?"#;

const SELECT_COLS_BY_KEY: &str = r#"SELECT
  batch_id, survey_id, interviewer_id, tenant_id, batch_date,
  status, total_responses, sample_percentage, approval_rules,
  approved_count, rejected_count, pending_count, approval_rate,
  remainder_decision, remainder_decided_at, remainder_trigger_rate,
  processing_started_at, created_at, version
FROM batches WHERE survey_id = ? AND interviewer_id = ? AND status = ?"#;

fn row_to_batch(r: &sqlx::any::AnyRow) -> anyhow::Result<Batch> {
    let id_str: String = r.get("batch_id");
    let id = BatchId(uuid::Uuid::parse_str(&id_str).context("invalid batch_id")?);

    let status_str: String = r.get("status");
    let status =
        BatchStatus::parse(&status_str).ok_or_else(|| anyhow!("unknown batch status: {status_str}"))?;

    let remainder_str: String = r.get("remainder_decision");
    let remainder_decision = RemainderDecision::parse(&remainder_str)
        .ok_or_else(|| anyhow!("unknown remainder decision: {remainder_str}"))?;

    let approval_rules_str: String = r.get("approval_rules");
    let config_snapshot: Option<BatchConfigSnapshot> =
        serde_json::from_str(&approval_rules_str).ok();

    let remainder_decided_at: Option<i64> = r.get("remainder_decided_at");

    Ok(Batch {
        id,
        tenant_id: TenantId(r.get("tenant_id")),
        survey_id: SurveyId(r.get("survey_id")),
        interviewer_id: InterviewerId(r.get("interviewer_id")),
        batch_date: r.get("batch_date"),
        status,
        total_responses: r.get::<i64, _>("total_responses") as u64,
        config_snapshot,
        stats: QcStats {
            approved_count: r.get::<i64, _>("approved_count") as u64,
            rejected_count: r.get::<i64, _>("rejected_count") as u64,
            pending_count: r.get::<i64, _>("pending_count") as u64,
            approval_rate: r.get("approval_rate"),
        },
        remainder_decision,
        remainder_decided_at: i64_to_opt_ts(remainder_decided_at)?,
        remainder_trigger_rate: r.get("remainder_trigger_rate"),
        processing_started_at: i64_to_opt_ts(r.get::<Option<i64>, _>("processing_started_at"))?,
        created_at: i64_to_ts(r.get("created_at"))?,
        version: r.get("version"),
    })
}
