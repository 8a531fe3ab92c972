use sqlx::AnyPool;

/// Runs idempotent `CREATE TABLE IF NOT EXISTS` migrations at startup,
/// following the teacher's `backend::db::schema::migrate`.
///
/// `responses.batch_ref` plus `responses.is_sample_response` double as the
/// Batch's `responses`/`sampleResponses`/`remainingResponses` sets (spec.md
/// §3 invariant: every response in a batch carries that batch's id) —
/// there is no separate join table. `responses.batch_seq` preserves
/// insertion order within a batch for the "ordered set" requirement.
pub async fn migrate(pool: &AnyPool) -> anyhow::Result<()> {
    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS responses (
  response_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  survey_id TEXT NOT NULL,
  interviewer_id TEXT NOT NULL,
  mode TEXT NOT NULL,
  selected_ac TEXT,
  created_at BIGINT NOT NULL,

  status TEXT NOT NULL,
  is_sample_response BIGINT NOT NULL DEFAULT 0,
  batch_ref TEXT,
  batch_seq BIGINT,

  verification_reviewer TEXT,
  verification_decided_at BIGINT,
  verification_verdict TEXT,
  verification_feedback TEXT,
  verification_auto_approved BIGINT,
  verification_auto_rejected BIGINT,
  verification_batch_id TEXT,

  leased_to TEXT,
  leased_at BIGINT,
  lease_expires_at BIGINT,
  last_skipped_at BIGINT,

  metadata TEXT NOT NULL DEFAULT '{}'
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS batches (
  batch_id TEXT PRIMARY KEY,
  survey_id TEXT NOT NULL,
  interviewer_id TEXT NOT NULL,
  tenant_id TEXT NOT NULL,
  batch_date TEXT NOT NULL,

  status TEXT NOT NULL,
  total_responses BIGINT NOT NULL DEFAULT 0,

  sample_percentage BIGINT,
  approval_rules TEXT,

  approved_count BIGINT NOT NULL DEFAULT 0,
  rejected_count BIGINT NOT NULL DEFAULT 0,
  pending_count BIGINT NOT NULL DEFAULT 0,
  approval_rate DOUBLE PRECISION NOT NULL DEFAULT 0,

  remainder_decision TEXT NOT NULL DEFAULT 'pending',
  remainder_decided_at BIGINT,
  remainder_trigger_rate DOUBLE PRECISION,

  processing_started_at BIGINT,
  created_at BIGINT NOT NULL,
  version BIGINT NOT NULL DEFAULT 0
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
CREATE TABLE IF NOT EXISTS qc_configs (
  config_id TEXT PRIMARY KEY,
  tenant_id TEXT NOT NULL,
  survey_id TEXT,
  active BIGINT NOT NULL DEFAULT 1,
  sample_percentage BIGINT NOT NULL,
  approval_rules TEXT NOT NULL,
  notes TEXT,
  created_at BIGINT NOT NULL
);
"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_responses_survey_status
           ON responses(survey_id, status);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_responses_batch_ref
           ON responses(batch_ref);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_responses_lease_expiry
           ON responses(status, lease_expires_at);"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_batches_lookup
           ON batches(survey_id, interviewer_id, status);"#,
    )
    .execute(pool)
    .await?;

    // At most one `collecting` batch per (survey, interviewer) at any
    // time (spec.md §3 invariant, §8 invariant 5): the uniqueness
    // `find_or_create_collecting` relies on to make its insert-if-absent
    // race-safe. `batch_date` is stamped once at creation time and is
    // not part of this key.
    sqlx::query(
        r#"CREATE UNIQUE INDEX IF NOT EXISTS idx_batches_one_collecting
           ON batches(survey_id, interviewer_id)
           WHERE status = 'collecting';"#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"CREATE INDEX IF NOT EXISTS idx_qc_configs_lookup
           ON qc_configs(tenant_id, survey_id, active);"#,
    )
    .execute(pool)
    .await?;

    Ok(())
}
