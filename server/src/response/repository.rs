use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::ids::{AgentId, BatchId, ResponseId, SurveyId};
use crate::response::{Mode, Response, ResponseStatus, Verification};

/// Persistence boundary for Responses (component A, spec.md §4.A).
///
/// Every mutator here is required to be atomic with respect to a single
/// response's `status`, `is_sample_response`, `batch_ref`, and
/// `verification` fields, and accepts only the transitions named in the
/// response lifecycle. Lease mutators additionally guarantee at most one
/// non-expired lease per response at any instant (spec.md §8, invariant 4).
#[async_trait]
pub trait ResponseRepository: Send + Sync {
    /// Persists a newly submitted response (status `Submitted`).
    async fn mark_submitted(&self, response: Response) -> anyhow::Result<Response>;

    async fn fetch_by_id(&self, id: &ResponseId) -> anyhow::Result<Option<Response>>;

    /// `(survey, mode, time window, status)` query used by admin/batch
    /// listing surfaces. `mode`/`status`/`since` are optional filters.
    async fn fetch_by_survey(
        &self,
        survey_id: &SurveyId,
        mode: Option<Mode>,
        status: Option<ResponseStatus>,
        since: Option<DateTime<Utc>>,
        limit: usize,
    ) -> anyhow::Result<Vec<Response>>;

    /// Attaches a response to a batch. Response status remains `Submitted`
    /// until seal (spec.md §4.D step 3). Idempotent: a no-op if the
    /// response is already attached to this batch.
    async fn attach_to_batch(&self, id: &ResponseId, batch_id: &BatchId) -> anyhow::Result<()>;

    /// Seal-time transition: sets `is_sample_response` and moves the
    /// response to `PendingApproval` (spec.md §4.E steps 3-4).
    async fn mark_sample_or_remainder(
        &self,
        id: &ResponseId,
        is_sample: bool,
    ) -> anyhow::Result<()>;

    /// Transitions `PendingApproval -> Approved`. Returns `false` (no-op)
    /// if the response is no longer `PendingApproval` (idempotence law,
    /// spec.md §8).
    async fn approve(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool>;

    /// Transitions `PendingApproval -> Rejected`. Returns `false` (no-op)
    /// under the same idempotence rule as `approve`.
    async fn reject(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool>;

    /// Bulk remainder-decision application (spec.md §4.E step 5):
    /// transitions every response in `ids` from `PendingApproval` to
    /// either `Approved` or `Rejected`, stamping `verification` with
    /// `auto_approved`/`auto_rejected` set. Not used for `send_to_qc`,
    /// which instead calls `mark_sample_or_remainder`.
    async fn record_auto_decision(
        &self,
        ids: &[ResponseId],
        approved: bool,
        verification_template: Verification,
    ) -> anyhow::Result<u64>;

    /// Conditional lease acquisition: succeeds only if no unexpired lease
    /// currently exists on this response (spec.md §4.G step 4).
    async fn try_acquire_lease(
        &self,
        id: &ResponseId,
        agent: &AgentId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Releases a lease iff `agent` currently holds it. A silent no-op
    /// otherwise (unknown/foreign lease), per spec.md §4.G failure modes.
    async fn release_lease(&self, id: &ResponseId, agent: &AgentId) -> anyhow::Result<()>;

    /// Releases the lease (if owned by `agent`) and stamps
    /// `last_skipped_at = now`. Returns `false` if the caller does not
    /// own the current lease (Forbidden), per spec.md §4.G.
    async fn skip(
        &self,
        id: &ResponseId,
        agent: &AgentId,
        now: DateTime<Utc>,
    ) -> anyhow::Result<bool>;

    /// Clears every lease with `expires_at <= now`. Returns the number of
    /// leases cleared, for scheduler observability.
    async fn clear_expired_leases(&self, now: DateTime<Utc>) -> anyhow::Result<u64>;

    /// Source-of-truth query for the Assignment View refresh (spec.md
    /// §4.F): responses that are `PendingApproval` and either sampled or
    /// owned by a batch currently `queued_for_qc`.
    async fn fetch_dispatchable(
        &self,
        queued_for_qc_batches: &[BatchId],
        limit: usize,
        offset: usize,
    ) -> anyhow::Result<Vec<Response>>;

    /// Every response attached to `batch_id`, in insertion order. Used
    /// by the Sampling & Remainder Processor at seal time and by
    /// remainder-decision evaluation to recompute `qcStats` (spec.md
    /// §4.E).
    async fn fetch_by_batch(&self, batch_id: &BatchId) -> anyhow::Result<Vec<Response>>;
}
