use std::sync::Arc;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tracing::warn;

use crate::batch::repository::BatchRepository;
use crate::batch::{BatchStatus, QcStats, RemainderDecision};
use crate::config::AppConfig;
use crate::ids::{BatchId, SurveyId};
use crate::qc_config::repository::QcConfigRepository;
use crate::qc_config::{resolve_action, Action, ApprovalRule};
use crate::response::repository::ResponseRepository;
use crate::response::{ResponseStatus, Verdict, Verification};

/// Component E: draws a batch's sample at seal time and, once every
/// sampled response carries a terminal verification, resolves the
/// remainder's disposition against the approval-rule table (spec.md
/// §4.E).
pub struct SamplingEngine<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    responses: Arc<RR>,
    batches: Arc<BR>,
    config: Arc<AppConfig>,
    _marker: std::marker::PhantomData<CR>,
}

impl<RR, BR, CR> SamplingEngine<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    pub fn new(responses: Arc<RR>, batches: Arc<BR>, config: Arc<AppConfig>) -> Self {
        Self {
            responses,
            batches,
            config,
            _marker: std::marker::PhantomData,
        }
    }

    /// `Seal(b)` (spec.md §4.E steps 1-2): draws a random sample of
    /// `ceil(|responses| * samplePercentage / 100)` responses (capped at
    /// the batch's size), marks the rest as remainder, and moves every
    /// one of them to `PendingApproval`. A no-op if `b` is not currently
    /// `Collecting` or carries no responses — `Seal(b)` twice is
    /// idempotent (spec.md §8).
    pub async fn seal_batch(&self, batch_id: &BatchId) -> anyhow::Result<()> {
        let Some(batch) = self.batches.fetch_by_id(batch_id).await? else {
            return Ok(());
        };
        if batch.status != BatchStatus::Collecting {
            return Ok(());
        }

        let responses = self.responses.fetch_by_batch(batch_id).await?;
        if responses.is_empty() {
            return Ok(());
        }

        let sample_percentage = batch
            .config_snapshot
            .as_ref()
            .map(|c| c.sample_percentage)
            .unwrap_or(self.config.fallback_sample_percentage);

        let k = ((responses.len() as f64) * (sample_percentage as f64) / 100.0).ceil() as usize;
        let k = k.min(responses.len());

        let mut ids: Vec<_> = responses.iter().map(|r| r.id).collect();
        let mut rng = StdRng::from_entropy();
        ids.shuffle(&mut rng);
        let (sample, remainder) = ids.split_at(k);

        for id in sample {
            self.responses.mark_sample_or_remainder(id, true).await?;
        }
        for id in remainder {
            self.responses.mark_sample_or_remainder(id, false).await?;
        }

        if !self.batches.seal(batch_id, batch.version, crate::time::now()).await? {
            warn!(batch_id = %batch_id, "seal lost the version race, leaving batch for the next trigger");
        }

        Ok(())
    }

    /// Re-checks every `QcInProgress` batch belonging to `survey_id` for
    /// a resolvable remainder decision. Called opportunistically after
    /// every verification and response submission (spec.md §4.D step 5,
    /// §4.H step 4) and by the scheduler's sweep.
    pub async fn evaluate_all_pending(&self, survey_id: &SurveyId) -> anyhow::Result<()> {
        let batches = self.batches.fetch_qc_in_progress_for_survey(survey_id).await?;
        for batch in batches {
            if let Err(e) = self.evaluate_remainder_decision(&batch.id).await {
                warn!(batch_id = %batch.id, error = %e, "remainder decision evaluation failed");
            }
        }
        Ok(())
    }

    /// `EvaluateRemainderDecision(b)` (spec.md §4.E steps 1-6): once
    /// every sampled response has a terminal verdict, resolves the
    /// remainder's action against the rule table frozen in the batch's
    /// `config_snapshot` and applies it atomically.
    async fn evaluate_remainder_decision(&self, batch_id: &BatchId) -> anyhow::Result<()> {
        let Some(batch) = self.batches.fetch_by_id(batch_id).await? else {
            return Ok(());
        };
        if batch.status != BatchStatus::QcInProgress {
            return Ok(());
        }

        let responses = self.responses.fetch_by_batch(batch_id).await?;

        let mut stats = QcStats::default();
        for r in responses.iter().filter(|r| r.is_sample_response) {
            match r.status {
                ResponseStatus::PendingApproval => stats.pending_count += 1,
                ResponseStatus::Approved => stats.approved_count += 1,
                ResponseStatus::Rejected => stats.rejected_count += 1,
                _ => {}
            }
        }
        stats.recompute_rate();

        // Best-effort: persist live stats regardless of whether the
        // sample is fully decided yet. A lost CAS here just means a
        // sibling verification already refreshed them.
        let _ = self.batches.update_stats(batch_id, batch.version, stats).await?;

        // Step 1: not every sampled response has a verdict yet.
        if stats.pending_count > 0 {
            return Ok(());
        }
        // Degenerate: a sample with nothing decided (e.g. zero-size
        // sample). Nothing to resolve against.
        if stats.approved_count + stats.rejected_count == 0 {
            return Ok(());
        }

        let rules: Vec<ApprovalRule> = batch
            .config_snapshot
            .as_ref()
            .map(|c| serde_json::from_value(c.approval_rules.clone()).unwrap_or_default())
            .unwrap_or_default();
        let action = resolve_action(&rules, stats.approval_rate);

        let remainder_ids: Vec<_> = responses
            .iter()
            .filter(|r| !r.is_sample_response)
            .map(|r| r.id)
            .collect();

        let decision = match action {
            Action::AutoApprove => RemainderDecision::AutoApprove,
            Action::SendToQc => RemainderDecision::SendToQc,
            Action::RejectAll => RemainderDecision::RejectAll,
        };

        match action {
            Action::AutoApprove if !remainder_ids.is_empty() => {
                let template = Verification {
                    reviewer: None,
                    decided_at: crate::time::now(),
                    verdict: Verdict::Approve,
                    feedback: "auto-approved: remainder of a batch with an approval rate above the auto-approve threshold".into(),
                    auto_approved: true,
                    auto_rejected: false,
                    triggering_batch_id: *batch_id,
                };
                self.responses.record_auto_decision(&remainder_ids, true, template).await?;
            }
            Action::RejectAll if !remainder_ids.is_empty() => {
                let template = Verification {
                    reviewer: None,
                    decided_at: crate::time::now(),
                    verdict: Verdict::Reject,
                    feedback: "auto-rejected: remainder of a batch with an approval rate below the reject threshold".into(),
                    auto_approved: false,
                    auto_rejected: true,
                    triggering_batch_id: *batch_id,
                };
                self.responses.record_auto_decision(&remainder_ids, false, template).await?;
            }
            // send_to_qc: the remainder is already PendingApproval with
            // isSampleResponse = false from seal time; only the batch's
            // status needs to advance so the Dispatcher picks it up.
            _ => {}
        }

        if !self
            .batches
            .set_remainder_decision(batch_id, batch.version, decision, Some(stats.approval_rate), crate::time::now())
            .await?
        {
            warn!(batch_id = %batch_id, "set_remainder_decision lost the version race, leaving for the next trigger");
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::{Batch, BatchConfigSnapshot};
    use crate::ids::{ConfigId, InterviewerId, ResponseId, TenantId};
    use crate::qc_config::{Action, ApprovalRule, QcConfig};
    use crate::qc_config::repository::QcConfigRepository;
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

        async fn attach_to_batch(&self, id: &ResponseId, batch_id: &BatchId) -> anyhow::Result<()> {
            if let Some(r) = self.0.lock().get_mut(id) {
                r.batch_ref = Some(*batch_id);
            }
            Ok(())
        }

        async fn mark_sample_or_remainder(&self, id: &ResponseId, is_sample: bool) -> anyhow::Result<()> {
            if let Some(r) = self.0.lock().get_mut(id) {
                r.is_sample_response = is_sample;
                r.status = ResponseStatus::PendingApproval;
            }
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
            Ok(true)
        }

        async fn record_auto_decision(
            &self,
            ids: &[ResponseId],
            approved: bool,
            verification_template: Verification,
        ) -> anyhow::Result<u64> {
            let mut guard = self.0.lock();
            let mut n = 0;
            for id in ids {
                if let Some(r) = guard.get_mut(id) {
                    r.status = if approved {
                        ResponseStatus::Approved
                    } else {
                        ResponseStatus::Rejected
                    };
                    r.verification = Some(verification_template.clone());
                    n += 1;
                }
            }
            Ok(n)
        }

        async fn try_acquire_lease(
            &self,
            _id: &ResponseId,
            _agent: &crate::ids::AgentId,
            _now: chrono::DateTime<Utc>,
            _expires_at: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            Ok(true)
        }

        async fn release_lease(&self, _id: &ResponseId, _agent: &crate::ids::AgentId) -> anyhow::Result<()> {
            Ok(())
        }

        async fn skip(
            &self,
            _id: &ResponseId,
            _agent: &crate::ids::AgentId,
            _now: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
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
            let mut out: Vec<_> = self
                .0
                .lock()
                .values()
                .filter(|r| r.batch_ref == Some(*batch_id))
                .cloned()
                .collect();
            out.sort_by_key(|r| r.id.0);
            Ok(out)
        }
    }

    struct MemBatches(Mutex<HashMap<BatchId, Batch>>);

    #[async_trait]
    impl BatchRepository for MemBatches {
        async fn find_or_create_collecting(
            &self,
            tenant_id: &TenantId,
            survey_id: &SurveyId,
            interviewer_id: &InterviewerId,
            batch_date: &str,
            config_snapshot: BatchConfigSnapshot,
            now: chrono::DateTime<Utc>,
        ) -> anyhow::Result<Batch> {
            let batch = Batch {
                id: BatchId::new(),
                tenant_id: tenant_id.clone(),
                survey_id: survey_id.clone(),
                interviewer_id: interviewer_id.clone(),
                batch_date: batch_date.to_string(),
                status: BatchStatus::Collecting,
                total_responses: 0,
                config_snapshot: Some(config_snapshot),
                stats: QcStats::default(),
                remainder_decision: RemainderDecision::Pending,
                remainder_decided_at: None,
                remainder_trigger_rate: None,
                processing_started_at: None,
                created_at: now,
                version: 0,
            };
            self.0.lock().insert(batch.id, batch.clone());
            Ok(batch)
        }

        async fn fetch_by_id(&self, id: &BatchId) -> anyhow::Result<Option<Batch>> {
            Ok(self.0.lock().get(id).cloned())
        }

        async fn append_response(
            &self,
            id: &BatchId,
            expected_version: i64,
            capacity: i64,
        ) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(b) = guard.get_mut(id) else { return Ok(false) };
            if b.version != expected_version || b.total_responses >= capacity as u64 {
                return Ok(false);
            }
            b.total_responses += 1;
            b.version += 1;
            Ok(true)
        }

        async fn seal(&self, id: &BatchId, expected_version: i64, now: chrono::DateTime<Utc>) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(b) = guard.get_mut(id) else { return Ok(false) };
            if b.version != expected_version {
                return Ok(false);
            }
            b.status = BatchStatus::QcInProgress;
            b.processing_started_at = Some(now);
            b.version += 1;
            Ok(true)
        }

        async fn update_stats(&self, id: &BatchId, expected_version: i64, stats: QcStats) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(b) = guard.get_mut(id) else { return Ok(false) };
            if b.version != expected_version {
                return Ok(false);
            }
            b.stats = stats;
            b.version += 1;
            Ok(true)
        }

        async fn set_remainder_decision(
            &self,
            id: &BatchId,
            expected_version: i64,
            decision: RemainderDecision,
            trigger_rate: Option<f64>,
            now: chrono::DateTime<Utc>,
        ) -> anyhow::Result<bool> {
            let mut guard = self.0.lock();
            let Some(b) = guard.get_mut(id) else { return Ok(false) };
            if b.version != expected_version {
                return Ok(false);
            }
            b.remainder_decision = decision;
            b.remainder_decided_at = Some(now);
            b.remainder_trigger_rate = trigger_rate;
            b.status = match decision {
                RemainderDecision::AutoApprove => BatchStatus::AutoApproved,
                RemainderDecision::SendToQc => BatchStatus::QueuedForQc,
                RemainderDecision::RejectAll => BatchStatus::Completed,
                RemainderDecision::Pending => BatchStatus::QcInProgress,
            };
            b.version += 1;
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

        async fn fetch_qc_in_progress_for_survey(&self, survey_id: &SurveyId) -> anyhow::Result<Vec<Batch>> {
            Ok(self
                .0
                .lock()
                .values()
                .filter(|b| b.survey_id == *survey_id && b.status == BatchStatus::QcInProgress)
                .cloned()
                .collect())
        }

        async fn fetch_by_survey(
            &self,
            survey_id: &SurveyId,
            _limit: usize,
            _offset: usize,
        ) -> anyhow::Result<Vec<Batch>> {
            Ok(self
                .0
                .lock()
                .values()
                .filter(|b| b.survey_id == *survey_id)
                .cloned()
                .collect())
        }

        async fn fetch_all_qc_in_progress(&self) -> anyhow::Result<Vec<Batch>> {
            Ok(self
                .0
                .lock()
                .values()
                .filter(|b| b.status == BatchStatus::QcInProgress)
                .cloned()
                .collect())
        }

        async fn fetch_queued_for_qc_ids(&self) -> anyhow::Result<Vec<BatchId>> {
            Ok(self
                .0
                .lock()
                .values()
                .filter(|b| b.status == BatchStatus::QueuedForQc)
                .map(|b| b.id)
                .collect())
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

    fn survey() -> SurveyId {
        SurveyId("s1".into())
    }

    async fn seed_batch(
        responses: &MemResponses,
        batches: &MemBatches,
        n: usize,
        sample_percentage: u8,
        rules: Vec<ApprovalRule>,
    ) -> BatchId {
        let batch = batches
            .find_or_create_collecting(
                &TenantId("t1".into()),
                &survey(),
                &InterviewerId("i1".into()),
                "2026-07-27",
                BatchConfigSnapshot {
                    source_config_id: None,
                    sample_percentage,
                    approval_rules: serde_json::to_value(&rules).unwrap(),
                },
                Utc::now(),
            )
            .await
            .unwrap();

        for _ in 0..n {
            let r = Response {
                id: ResponseId::new(),
                tenant_id: TenantId("t1".into()),
                survey_id: survey(),
                interviewer_id: InterviewerId("i1".into()),
                mode: Mode::Capi,
                selected_ac: None,
                created_at: Utc::now(),
                status: ResponseStatus::Submitted,
                is_sample_response: false,
                batch_ref: Some(batch.id),
                verification: None,
                lease: None,
                last_skipped_at: None,
                metadata: serde_json::json!({}),
            };
            responses.mark_submitted(r).await.unwrap();
        }
        batches.append_response(&batch.id, batch.version, 100).await.unwrap();
        batch.id
    }

    fn always_auto_approve() -> Vec<ApprovalRule> {
        vec![ApprovalRule {
            min_rate: 0.0,
            max_rate: 100.0,
            action: Action::AutoApprove,
        }]
    }

    #[tokio::test]
    async fn seal_splits_sample_and_remainder_by_percentage() {
        let responses = Arc::new(MemResponses(Mutex::new(HashMap::new())));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::new())));
        let batch_id = seed_batch(&responses, &batches, 10, 50, always_auto_approve()).await;

        let engine: SamplingEngine<MemResponses, MemBatches, NoConfigs> =
            SamplingEngine::new(responses.clone(), batches.clone(), test_config());
        engine.seal_batch(&batch_id).await.unwrap();

        let batch = batches.fetch_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.status, BatchStatus::QcInProgress);

        let all = responses.fetch_by_batch(&batch_id).await.unwrap();
        let sample_count = all.iter().filter(|r| r.is_sample_response).count();
        assert_eq!(sample_count, 5);
        assert!(all.iter().all(|r| r.status == ResponseStatus::PendingApproval));
    }

    #[tokio::test]
    async fn seal_on_an_already_sealed_batch_is_a_no_op() {
        let responses = Arc::new(MemResponses(Mutex::new(HashMap::new())));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::new())));
        let batch_id = seed_batch(&responses, &batches, 4, 100, always_auto_approve()).await;

        let engine: SamplingEngine<MemResponses, MemBatches, NoConfigs> =
            SamplingEngine::new(responses.clone(), batches.clone(), test_config());
        engine.seal_batch(&batch_id).await.unwrap();
        let after_first = batches.fetch_by_id(&batch_id).await.unwrap().unwrap().version;
        engine.seal_batch(&batch_id).await.unwrap();
        let after_second = batches.fetch_by_id(&batch_id).await.unwrap().unwrap().version;

        assert_eq!(after_first, after_second);
    }

    #[tokio::test]
    async fn full_sample_auto_approves_remainder_once_fully_decided() {
        let responses = Arc::new(MemResponses(Mutex::new(HashMap::new())));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::new())));
        // 100% sample percentage still leaves a remainder slice of size
        // zero, exercising the degenerate remainder path alongside the
        // ordinary one.
        let batch_id = seed_batch(&responses, &batches, 10, 60, always_auto_approve()).await;

        let engine: SamplingEngine<MemResponses, MemBatches, NoConfigs> =
            SamplingEngine::new(responses.clone(), batches.clone(), test_config());
        engine.seal_batch(&batch_id).await.unwrap();

        let all = responses.fetch_by_batch(&batch_id).await.unwrap();
        let sample_ids: Vec<_> = all
            .iter()
            .filter(|r| r.is_sample_response)
            .map(|r| r.id)
            .collect();

        for id in &sample_ids {
            responses
                .approve(
                    id,
                    Verification {
                        reviewer: Some(crate::ids::AgentId("agent-1".into())),
                        decided_at: Utc::now(),
                        verdict: Verdict::Approve,
                        feedback: "looks fine".into(),
                        auto_approved: false,
                        auto_rejected: false,
                        triggering_batch_id: batch_id,
                    },
                )
                .await
                .unwrap();
        }

        engine.evaluate_all_pending(&survey()).await.unwrap();

        let batch = batches.fetch_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.remainder_decision, RemainderDecision::AutoApprove);
        assert_eq!(batch.status, BatchStatus::AutoApproved);

        let all = responses.fetch_by_batch(&batch_id).await.unwrap();
        assert!(all
            .iter()
            .filter(|r| !r.is_sample_response)
            .all(|r| r.status == ResponseStatus::Approved));
    }

    #[tokio::test]
    async fn remainder_decision_waits_for_every_sample_verdict() {
        let responses = Arc::new(MemResponses(Mutex::new(HashMap::new())));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::new())));
        let batch_id = seed_batch(&responses, &batches, 10, 50, always_auto_approve()).await;

        let engine: SamplingEngine<MemResponses, MemBatches, NoConfigs> =
            SamplingEngine::new(responses.clone(), batches.clone(), test_config());
        engine.seal_batch(&batch_id).await.unwrap();
        engine.evaluate_all_pending(&survey()).await.unwrap();

        let batch = batches.fetch_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.remainder_decision, RemainderDecision::Pending);
        assert_eq!(batch.status, BatchStatus::QcInProgress);
    }

    #[tokio::test]
    async fn low_approval_rate_rejects_remainder() {
        let responses = Arc::new(MemResponses(Mutex::new(HashMap::new())));
        let batches = Arc::new(MemBatches(Mutex::new(HashMap::new())));
        let rules = vec![ApprovalRule {
            min_rate: 0.0,
            max_rate: 100.0,
            action: Action::RejectAll,
        }];
        let batch_id = seed_batch(&responses, &batches, 10, 50, rules).await;

        let engine: SamplingEngine<MemResponses, MemBatches, NoConfigs> =
            SamplingEngine::new(responses.clone(), batches.clone(), test_config());
        engine.seal_batch(&batch_id).await.unwrap();

        let all = responses.fetch_by_batch(&batch_id).await.unwrap();
        let sample_ids: Vec<_> = all
            .iter()
            .filter(|r| r.is_sample_response)
            .map(|r| r.id)
            .collect();
        for id in &sample_ids {
            responses
                .reject(
                    id,
                    Verification {
                        reviewer: Some(crate::ids::AgentId("agent-1".into())),
                        decided_at: Utc::now(),
                        verdict: Verdict::Reject,
                        feedback: "bad interview".into(),
                        auto_approved: false,
                        auto_rejected: false,
                        triggering_batch_id: batch_id,
                    },
                )
                .await
                .unwrap();
        }

        engine.evaluate_all_pending(&survey()).await.unwrap();

        let batch = batches.fetch_by_id(&batch_id).await.unwrap().unwrap();
        assert_eq!(batch.remainder_decision, RemainderDecision::RejectAll);
        assert_eq!(batch.status, BatchStatus::Completed);

        let all = responses.fetch_by_batch(&batch_id).await.unwrap();
        assert!(all
            .iter()
            .filter(|r| !r.is_sample_response)
            .all(|r| r.status == ResponseStatus::Rejected));
    }
}
