use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::batch::{Batch, BatchConfigSnapshot, QcStats, RemainderDecision};
use crate::ids::{BatchId, InterviewerId, SurveyId, TenantId};

/// Persistence boundary for Batches (component B, spec.md §4.B).
///
/// Every mutator is expected to be a CAS (compare-and-swap) update keyed
/// on `version`, per the optimistic per-batch lock described in spec.md
/// §5: a caller that loses the race observes `Ok(false)` and should
/// reload and retry, never treat it as an error.
#[async_trait]
pub trait BatchRepository: Send + Sync {
    /// Finds the open `Collecting` batch for `(survey, interviewer)` — at
    /// most one may exist at any time (spec.md §3 invariant) — creating
    /// one stamped with today's `batch_date` and `config_snapshot` if
    /// none exists. Atomic: concurrent callers for the same key must
    /// observe the same created batch (spec.md §4.D step 2).
    async fn find_or_create_collecting(
        &self,
        tenant_id: &TenantId,
        survey_id: &SurveyId,
        interviewer_id: &InterviewerId,
        batch_date: &str,
        config_snapshot: BatchConfigSnapshot,
        now: DateTime<Utc>,
    ) -> anyhow::Result<Batch>;

    async fn fetch_by_id(&self, id: &BatchId) -> anyhow::Result<Option<Batch>>;

    /// Increments `total_responses` by one for an append already durably
    /// recorded on the response row. Fails the CAS (`Ok(false)`) if
    /// `expected_version` is stale, the batch is no longer `Collecting`,
    /// or `total_responses` has already reached `capacity` — the
    /// fullness check is part of the same conditional write, not a
    /// separate pre-check, so a concurrent appender can never observe a
    /// batch go over `capacity` (spec.md §4.B: "fails if batch not
    /// collecting or full").
    async fn append_response(
        &self,
        id: &BatchId,
        expected_version: i64,
        capacity: i64,
    ) -> anyhow::Result<bool>;

    /// Seals a `Collecting` batch: `Collecting -> QcInProgress`, stamping
    /// `processing_started_at`. CAS on `expected_version` (spec.md §4.D
    /// step 4c / §4.E step 1).
    async fn seal(
        &self,
        id: &BatchId,
        expected_version: i64,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Recomputes and persists `stats` after a verification is recorded
    /// (spec.md §4.H step 3). CAS on `expected_version`.
    async fn update_stats(
        &self,
        id: &BatchId,
        expected_version: i64,
        stats: QcStats,
    ) -> anyhow::Result<bool>;

    /// Records the seal-time remainder decision and transitions
    /// `QcInProgress -> AutoApproved | QueuedForQc | QcInProgress`
    /// (reject_all resolves immediately to `Completed` once bulk rejects
    /// land). CAS on `expected_version`.
    async fn set_remainder_decision(
        &self,
        id: &BatchId,
        expected_version: i64,
        decision: RemainderDecision,
        trigger_rate: Option<f64>,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Marks a batch `Completed` once every response it owns carries a
    /// terminal verification. CAS on `expected_version`.
    async fn finalize(&self, id: &BatchId, expected_version: i64) -> anyhow::Result<bool>;

    /// All `Collecting` batches whose `batch_date` is strictly before
    /// `cutoff_date`, for the daily-seal scheduler sweep (spec.md §4.I).
    async fn fetch_collecting_before(&self, cutoff_date: &str) -> anyhow::Result<Vec<Batch>>;

    /// All `QcInProgress` batches for `survey_id`, re-checked whenever a
    /// sibling response submission might have completed their sample
    /// (spec.md §4.D step 5) and by the scheduler's daily sweep.
    async fn fetch_qc_in_progress_for_survey(
        &self,
        survey_id: &SurveyId,
    ) -> anyhow::Result<Vec<Batch>>;

    /// All batches for `survey_id`, newest first, for the admin listing
    /// surface (spec.md §6 `GET /batches?survey=…`). Unlike the other
    /// `fetch_*` queries this is not filtered by status.
    async fn fetch_by_survey(
        &self,
        survey_id: &SurveyId,
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Batch>>;

    /// Every `QcInProgress` batch, across all surveys. Used by the
    /// scheduler's daily sweep (spec.md §4.I: "For every batch in
    /// qc_in_progress, call remainder-decision evaluation") and by the
    /// `/batches/process` admin trigger, neither of which is scoped to a
    /// single survey the way the opportunistic per-submission check is.
    async fn fetch_all_qc_in_progress(&self) -> anyhow::Result<Vec<Batch>>;

    /// Ids of every batch currently `queued_for_qc`, across all surveys.
    /// Used by the Assignment View refresh to widen `fetch_dispatchable`
    /// past sample-only responses (spec.md §4.F).
    async fn fetch_queued_for_qc_ids(&self) -> anyhow::Result<Vec<BatchId>>;
}
