use std::sync::Arc;

use tracing::warn;

use crate::assignment_view::AssignmentView;
use crate::batch::BatchStatus;
use crate::batch::repository::BatchRepository;
use crate::error::{AppError, AppResult};
use crate::ids::{AgentId, ResponseId};
use crate::qc_config::repository::QcConfigRepository;
use crate::response::repository::ResponseRepository;
use crate::response::{ResponseStatus, Verdict, Verification};
use crate::sampling::SamplingEngine;

/// Component H: accepts a quality agent's verdict on a leased Response,
/// mutates its status, refreshes the owning batch's live stats, and — if
/// the response was part of the sample — triggers the remainder-decision
/// evaluation (spec.md §4.H).
pub struct VerificationHandler<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    responses: Arc<RR>,
    batches: Arc<BR>,
    view: AssignmentView,
    sampling: Arc<SamplingEngine<RR, BR, CR>>,
}

impl<RR, BR, CR> VerificationHandler<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    pub fn new(
        responses: Arc<RR>,
        batches: Arc<BR>,
        view: AssignmentView,
        sampling: Arc<SamplingEngine<RR, BR, CR>>,
    ) -> Self {
        Self {
            responses,
            batches,
            view,
            sampling,
        }
    }

    /// `SubmitVerdict(agentId, responseId, verdict, feedback)` (spec.md
    /// §4.H steps 1-4). Preconditions (verbatim): the caller currently
    /// leases the response; the response is `PendingApproval`; the
    /// response's batch is currently accepting verdicts (`qc_in_progress`
    /// for the sample, or `queued_for_qc` for a routed remainder — see
    /// DESIGN.md for this precondition's resolution).
    pub async fn submit_verdict(
        &self,
        agent: &AgentId,
        response_id: &ResponseId,
        verdict: Verdict,
        feedback: String,
    ) -> AppResult<()> {
        let response = self
            .responses
            .fetch_by_id(response_id)
            .await
            .map_err(AppError::Other)?
            .ok_or_else(|| AppError::NotFound(format!("response {response_id} not found")))?;

        let leased_by_caller = response
            .lease
            .as_ref()
            .is_some_and(|l| l.leased_to == *agent && !l.is_expired(crate::time::now()));
        if !leased_by_caller {
            return Err(AppError::Forbidden(format!(
                "agent {agent} does not hold a current lease on response {response_id}"
            )));
        }

        if response.status != ResponseStatus::PendingApproval {
            // Idempotence law (spec.md §8): a repeated submission after
            // the response already left PendingApproval is rejected, not
            // re-applied. In practice this path is rarely reached since
            // losing the lease (above) already rejects most repeats.
            return Err(AppError::Forbidden(format!(
                "response {response_id} is no longer pending approval"
            )));
        }

        let Some(batch_id) = response.batch_ref else {
            return Err(AppError::Invariant(format!(
                "pending-approval response {response_id} carries no batch_ref"
            )));
        };

        let batch = self
            .batches
            .fetch_by_id(&batch_id)
            .await
            .map_err(AppError::Other)?
            .ok_or_else(|| AppError::NotFound(format!("batch {batch_id} not found")))?;

        if !matches!(batch.status, BatchStatus::QcInProgress | BatchStatus::QueuedForQc) {
            return Err(AppError::Validation(format!(
                "batch {batch_id} is not currently accepting verdicts (status {:?})",
                batch.status
            )));
        }

        let verification = Verification {
            reviewer: Some(agent.clone()),
            decided_at: crate::time::now(),
            verdict,
            feedback,
            auto_approved: false,
            auto_rejected: false,
            triggering_batch_id: batch_id,
        };

        let applied = match verdict {
            Verdict::Approve => self
                .responses
                .approve(response_id, verification)
                .await
                .map_err(AppError::Other)?,
            Verdict::Reject => self
                .responses
                .reject(response_id, verification)
                .await
                .map_err(AppError::Other)?,
        };

        if !applied {
            // Someone else's verdict (or a concurrent auto-decision) won
            // the race between our read and our write. Never a double
            // mutation — surface as Conflict so the caller can refresh.
            return Err(AppError::Conflict(format!(
                "response {response_id} was decided by a concurrent operation"
            )));
        }

        // Lease is cleared as part of the same conditional update inside
        // approve/reject; only the Assignment View needs invalidating.
        self.view.remove(response_id).await;

        if response.is_sample_response {
            if let Err(e) = self.sampling.evaluate_all_pending(&response.survey_id).await {
                warn!(batch_id = %batch_id, error = %e, "remainder decision evaluation failed after verdict");
            }
        } else if batch.status == BatchStatus::QueuedForQc {
            self.maybe_finalize_queued_batch(&batch_id).await;
        }

        Ok(())
    }

    /// Once every response routed to QC by a `send_to_qc` remainder
    /// decision carries a terminal verdict, the batch itself is
    /// terminal (spec.md §3: "terminal once remainder is decided").
    /// Uses `Finalize` (spec.md §4.B), the one Batch Store mutator that
    /// otherwise has no other caller in this pipeline.
    async fn maybe_finalize_queued_batch(&self, batch_id: &crate::ids::BatchId) {
        let responses = match self.responses.fetch_by_batch(batch_id).await {
            Ok(r) => r,
            Err(e) => {
                warn!(batch_id = %batch_id, error = %e, "failed to read batch responses for finalize check");
                return;
            }
        };

        let all_terminal = responses
            .iter()
            .all(|r| matches!(r.status, ResponseStatus::Approved | ResponseStatus::Rejected));
        if !all_terminal {
            return;
        }

        let Ok(Some(batch)) = self.batches.fetch_by_id(batch_id).await else {
            return;
        };
        if batch.status != BatchStatus::QueuedForQc {
            return;
        }

        if let Err(e) = self.batches.finalize(batch_id, batch.version).await {
            warn!(batch_id = %batch_id, error = %e, "finalize failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchConfigSnapshot, QcStats, RemainderDecision};
    use crate::config::AppConfig;
    use crate::ids::{BatchId, ConfigId, InterviewerId, SurveyId, TenantId};
    use crate::qc_config::QcConfig;
    use crate::response::{Mode, Response};
    use async_trait::async_trait;
    use chrono::Utc;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    struct MemResponses(Mutex<HashMap<ResponseId, Response>>);

    #[async_trait]
    impl ResponseRepository for MemResponses {
        async fn mark_submitted(&self, response: Response) -> anyhow::Result<Response> {
            self.0.lock().insert(response.id, response.clone());
            Ok(response)
        }

        async fn fetch_by_id(&self, id: &ResponseId) -> anyhow::Result<Option<Response>> {
            Ok(self.0.lock().get(id).cloned())
        }

        async fn fetch_by_survey(
            &self,
            _survey_id: &SurveyId,
            _mode: Option<Mode>,
            _status: Option<ResponseStatus>,
            _since: Option<chrono::DateTime<Utc>>,
            _limit: usize,
        ) -> anyhow::Result<Vec<Response>> {
            Ok(vec![])
        }

        async fn attach_to_batch(&self, _id: &ResponseId, _batch_id: &BatchId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn mark_sample_or_remainder(&self, _id: &ResponseId, _is_sample: bool) -> anyhow::Result<()> {
            Ok(())
        }

        async fn approve(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(r) = guard.get_mut(id) else { return Ok(false) };
            if r.status != ResponseStatus::PendingApproval {
                return Ok(false);
            }
            r.status = ResponseStatus::Approved;
            r.verification = Some(verification);
            r.lease = None;
            Ok(true)
        }

        async fn reject(&self, id: &ResponseId, verification: Verification) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(r) = guard.get_mut(id) else { return Ok(false) };
            if r.status != ResponseStatus::PendingApproval {
                return Ok(false);
            }
            r.status = ResponseStatus::Rejected;
            r.verification = Some(verification);
            r.lease = None;
            Ok(true)
        }

        async fn record_auto_decision(
            &self,
            _ids: &[ResponseId],
            _approved: bool,
            _verification_template: Verification,
        ) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn try_acquire_lease(
            &self,
            _id: &ResponseId,
            _agent: &AgentId,
            _now: chrono::DateTime<Utc>,
            _expires_at: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn release_lease(&self, _id: &ResponseId, _agent: &AgentId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn skip(&self, _id: &ResponseId, _agent: &AgentId, _now: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn clear_expired_leases(&self, _now: chrono::DateTime<Utc>) -> anyhow::Result<u64> {
            Ok(0)
        }

        async fn fetch_dispatchable(
            &self,
            _queued_for_qc_batches: &[BatchId],
            _limit: usize,
            _offset: usize,
        ) -> anyhow::Result<Vec<Response>> {
            Ok(vec![])
        }

        async fn fetch_by_batch(&self, batch_id: &BatchId) -> anyhow::Result<Vec<Response>> {
            Ok(self
                .0
                .lock()
                .values()
                .filter(|r| r.batch_ref == Some(*batch_id))
                .cloned()
                .collect())
        }
    }

    struct MemBatches(Mutex<HashMap<BatchId, Batch>>);

    #[async_trait]
    impl BatchRepository for MemBatches {
        async fn find_or_create_collecting(
            &self,
            _tenant_id: &TenantId,
            _survey_id: &SurveyId,
            _interviewer_id: &InterviewerId,
            _batch_date: &str,
            _config_snapshot: BatchConfigSnapshot,
            _now: chrono::DateTime<Utc>,
        ) -> anyhow::Result<Batch> {
            unreachable!("not exercised by these tests")
        }

        async fn fetch_by_id(&self, id: &BatchId) -> anyhow::Result<Option<Batch>> {
            Ok(self.0.lock().get(id).cloned())
        }

        async fn append_response(
            &self,
            _id: &BatchId,
            _expected_version: i64,
            _capacity: i64,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn seal(&self, _id: &BatchId, _expected_version: i64, _now: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn update_stats(&self, _id: &BatchId, _expected_version: i64, _stats: QcStats) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn set_remainder_decision(
            &self,
            _id: &BatchId,
            _expected_version: i64,
            _decision: RemainderDecision,
            _trigger_rate: Option<f64>,
            _now: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn finalize(&self, id: &BatchId, expected_version: i64) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(b) = guard.get_mut(id) else { return Ok(false) };
            if b.version != expected_version {
                return Ok(false);
            }
            b.status = BatchStatus::Completed;
            b.version += 1;
            Ok(true)
        }

        async fn fetch_collecting_before(&self, _cutoff_date: &str) -> anyhow::Result<Vec<Batch>> {
            Ok(vec![])
        }

        async fn fetch_qc_in_progress_for_survey(&self, _survey_id: &SurveyId) -> anyhow::Result<Vec<Batch>> {
            Ok(vec![])
        }

        async fn fetch_by_survey(
            &self,
            _survey_id: &SurveyId,
            _limit: usize,
            _offset: usize,
        ) -> anyhow::Result<Vec<Batch>> {
            Ok(vec![])
        }

        async fn fetch_all_qc_in_progress(&self) -> anyhow::Result<Vec<Batch>> {
            Ok(vec![])
        }

        async fn fetch_queued_for_qc_ids(&self) -> anyhow::Result<Vec<BatchId>> {
            Ok(vec![])
        }
    }

    struct NoConfigs;

    #[async_trait]
    impl QcConfigRepository for NoConfigs {
        async fn upsert(&self, config: QcConfig) -> anyhow::Result<QcConfig> {
            Ok(config)
        }
        async fn fetch_by_id(&self, _id: &ConfigId) -> anyhow::Result<Option<QcConfig>> {
            Ok(None)
        }
        async fn fetch_active_for_survey(
            &self,
            _tenant_id: &TenantId,
            _survey_id: &SurveyId,
        ) -> anyhow::Result<Option<QcConfig>> {
            Ok(None)
        }
        async fn fetch_active_default(&self, _tenant_id: &TenantId) -> anyhow::Result<Option<QcConfig>> {
            Ok(None)
        }
        async fn deactivate(&self, _id: &ConfigId) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn test_config() -> Arc<AppConfig> {
        Arc::new(AppConfig {
            database_url: "sqlite::memory:".into(),
            http_addr: "0.0.0.0:0".into(),
            batch_capacity: 100,
            fallback_sample_percentage: 40,
            lease_duration_min: 30,
            max_dispatch_retries: 5,
            view_refresh_sec: 10,
            lease_gc_interval_sec: 60,
            daily_seal_tz: chrono_tz::UTC,
        })
    }

    fn batch(status: BatchStatus) -> Batch {
        Batch {
            id: BatchId::new(),
            tenant_id: TenantId("t1".into()),
            survey_id: SurveyId("s1".into()),
            interviewer_id: InterviewerId("i1".into()),
            batch_date: "2026-07-27".into(),
            status,
            total_responses: 1,
            config_snapshot: None,
            stats: QcStats::default(),
            remainder_decision: RemainderDecision::Pending,
            remainder_decided_at: None,
            remainder_trigger_rate: None,
            processing_started_at: None,
            created_at: Utc::now(),
            version: 0,
        }
    }

    fn leased_response(batch_id: BatchId, agent: &AgentId, is_sample: bool) -> Response {
        Response {
            id: ResponseId::new(),
            tenant_id: TenantId("t1".into()),
            survey_id: SurveyId("s1".into()),
            interviewer_id: InterviewerId("i1".into()),
            mode: Mode::Capi,
            selected_ac: None,
            created_at: Utc::now(),
            status: ResponseStatus::PendingApproval,
            is_sample_response: is_sample,
            batch_ref: Some(batch_id),
            verification: None,
            lease: Some(crate::response::Lease {
                leased_to: agent.clone(),
                leased_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::minutes(30),
            }),
            last_skipped_at: None,
            metadata: serde_json::json!({}),
        }
    }

    fn handler(
        responses: Arc<MemResponses>,
        batches: Arc<MemBatches>,
    ) -> VerificationHandler<MemResponses, MemBatches, NoConfigs> {
        let sampling = Arc::new(SamplingEngine::new(
            responses.clone(),
            batches.clone(),
            test_config(),
        ));
        VerificationHandler::new(responses, batches, AssignmentView::new(), sampling)
    }

    #[tokio::test]
    async fn approve_by_the_leasing_agent_succeeds() {
        let b = batch(BatchStatus::QcInProgress);
        let agent = AgentId("agent-1".into());
        let r = leased_response(b.id, &agent, true);
        let rid = r.id;

        let responses = Arc::new(MemResponses(Mutex::new(HashMap::from([(rid, r)]))));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::from([(b.id, b)]))));
        let h = handler(responses.clone(), batches);

        h.submit_verdict(&agent, &rid, Verdict::Approve, "fine".into())
            .await
            .unwrap();

        let updated = responses.fetch_by_id(&rid).await.unwrap().unwrap();
        assert_eq!(updated.status, ResponseStatus::Approved);
    }

    #[tokio::test]
    async fn verdict_from_a_non_holder_is_forbidden() {
        let b = batch(BatchStatus::QcInProgress);
        let agent = AgentId("agent-1".into());
        let other = AgentId("agent-2".into());
        let r = leased_response(b.id, &agent, true);
        let rid = r.id;

        let responses = Arc::new(MemResponses(Mutex::new(HashMap::from([(rid, r)]))));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::from([(b.id, b)]))));
        let h = handler(responses, batches);

        let err = h
            .submit_verdict(&other, &rid, Verdict::Approve, "nope".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));
    }

    #[tokio::test]
    async fn repeated_verdict_after_success_is_rejected_not_reapplied() {
        let b = batch(BatchStatus::QcInProgress);
        let agent = AgentId("agent-1".into());
        let r = leased_response(b.id, &agent, true);
        let rid = r.id;

        let responses = Arc::new(MemResponses(Mutex::new(HashMap::from([(rid, r)]))));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::from([(b.id, b)]))));
        let h = handler(responses.clone(), batches);

        h.submit_verdict(&agent, &rid, Verdict::Approve, "first".into())
            .await
            .unwrap();

        // The lease was cleared by the first success, so a second call
        // by the same agent now fails the "caller holds the lease"
        // precondition rather than re-mutating the response.
        let err = h
            .submit_verdict(&agent, &rid, Verdict::Reject, "second".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Forbidden(_)));

        let updated = responses.fetch_by_id(&rid).await.unwrap().unwrap();
        assert_eq!(updated.status, ResponseStatus::Approved);
    }

    #[tokio::test]
    async fn verdict_on_a_batch_not_accepting_verdicts_is_rejected() {
        let b = batch(BatchStatus::Collecting);
        let agent = AgentId("agent-1".into());
        let r = leased_response(b.id, &agent, true);
        let rid = r.id;

        let responses = Arc::new(MemResponses(Mutex::new(HashMap::from([(rid, r)]))));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::from([(b.id, b)]))));
        let h = handler(responses, batches);

        let err = h
            .submit_verdict(&agent, &rid, Verdict::Approve, "x".into())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn last_remainder_verdict_finalizes_a_queued_for_qc_batch() {
        let mut b = batch(BatchStatus::QueuedForQc);
        b.total_responses = 1;
        let agent = AgentId("agent-1".into());
        let r = leased_response(b.id, &agent, false);
        let rid = r.id;
        let bid = b.id;

        let responses = Arc::new(MemResponses(Mutex::new(HashMap::from([(rid, r)]))));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::from([(bid, b)]))));
        let h = handler(responses, batches.clone());

        h.submit_verdict(&agent, &rid, Verdict::Approve, "ok".into())
            .await
            .unwrap();

        let updated_batch = batches.fetch_by_id(&bid).await.unwrap().unwrap();
        assert_eq!(updated_batch.status, BatchStatus::Completed);
    }
}
