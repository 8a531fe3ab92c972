use std::sync::Arc;

use tracing::{info, warn};

use crate::batch::repository::BatchRepository;
use crate::batch::{Batch, BatchConfigSnapshot};
use crate::config::AppConfig;
use crate::error::AppError;
use crate::ids::ResponseId;
use crate::qc_config::repository::QcConfigRepository;
use crate::qc_config::resolver::ConfigResolver;
use crate::response::repository::ResponseRepository;
use crate::response::ResponseStatus;
use crate::sampling::SamplingEngine;

/// Bound on the `find_or_create_collecting` + `append_response` retry
/// loop (spec.md: "batch-append capacity race... retried internally up
/// to a small bound"). Mirrors `Dispatcher::MAX_DISPATCH_RETRIES`'s role
/// as a liveness guard, not a correctness requirement.
const MAX_BATCH_APPEND_RETRIES: usize = 5;

/// Component D: assigns newly submitted responses to the current
/// `Collecting` batch for their `(survey, interviewer)`, sealing it when
/// it reaches capacity (spec.md §4.D).
pub struct BatchingEngine<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    responses: Arc<RR>,
    batches: Arc<BR>,
    config_resolver: Arc<ConfigResolver<CR>>,
    sampling: Arc<SamplingEngine<RR, BR, CR>>,
    config: Arc<AppConfig>,
}

impl<RR, BR, CR> BatchingEngine<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    pub fn new(
        responses: Arc<RR>,
        batches: Arc<BR>,
        config_resolver: Arc<ConfigResolver<CR>>,
        sampling: Arc<SamplingEngine<RR, BR, CR>>,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            responses,
            batches,
            config_resolver,
            sampling,
            config,
        }
    }

    /// `OnResponseSubmitted` (spec.md §4.D, steps 1-5).
    pub async fn on_response_submitted(&self, response_id: &ResponseId) -> anyhow::Result<()> {
        let response = self
            .responses
            .fetch_by_id(response_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("response not found: {response_id}"))?;

        // Step 1: defensive skip.
        if response.status == ResponseStatus::Abandoned {
            return Ok(());
        }
        if !response.is_batchable() {
            // Duplicate-append idempotence: already attached.
            return Ok(());
        }

        let qc_config = self
            .config_resolver
            .resolve(&response.tenant_id, &response.survey_id)
            .await?;

        let (sample_percentage, approval_rules, source_config_id) = match &qc_config {
            Some(c) => (
                c.sample_percentage,
                serde_json::to_value(&c.approval_rules)?,
                Some(c.id),
            ),
            None => (
                self.config.fallback_sample_percentage,
                serde_json::to_value(Vec::<serde_json::Value>::new())?,
                None,
            ),
        };

        let batch_date = crate::time::logical_day(&self.config.daily_seal_tz);
        let config_snapshot = BatchConfigSnapshot {
            source_config_id,
            sample_percentage,
            approval_rules,
        };

        // Steps 2-4: find-or-create + append is retried as one bounded
        // unit (spec.md: "batch-append capacity race... retried
        // internally up to a small bound"). A lost CAS can mean the
        // batch we read is now sealed, full, or stale-versioned under
        // us; `attach_to_batch` is idempotent and re-pointed at whatever
        // batch we land on next, so the response is never left
        // half-attached to a batch it never actually joined.
        let mut batch: Option<Batch> = None;
        for attempt in 0..MAX_BATCH_APPEND_RETRIES {
            let candidate = self
                .batches
                .find_or_create_collecting(
                    &response.tenant_id,
                    &response.survey_id,
                    &response.interviewer_id,
                    &batch_date,
                    config_snapshot.clone(),
                    crate::time::now(),
                )
                .await?;

            self.responses
                .attach_to_batch(response_id, &candidate.id)
                .await?;

            let appended = self
                .batches
                .append_response(
                    &candidate.id,
                    candidate.version,
                    self.config.batch_capacity as i64,
                )
                .await?;

            if appended {
                batch = Some(candidate);
                break;
            }

            warn!(
                batch_id = %candidate.id,
                attempt,
                "append_response lost the version/capacity race, retrying"
            );
        }

        let Some(batch) = batch else {
            return Err(AppError::Invariant(format!(
                "response {response_id} could not be appended to a collecting batch for \
                 (survey={}, interviewer={}) after {MAX_BATCH_APPEND_RETRIES} retries",
                response.survey_id, response.interviewer_id
            ))
            .into());
        };

        let total_after = batch.total_responses + 1;
        if total_after as usize >= self.config.batch_capacity {
            // Step 4: synchronous seal at capacity.
            if let Err(e) = self.sampling.seal_batch(&batch.id).await {
                warn!(batch_id = %batch.id, error = %e, "seal at capacity failed");
            } else {
                info!(batch_id = %batch.id, total = total_after, "batch sealed at capacity");
            }
        }

        // Step 5: opportunistically let adjudicated siblings finalize.
        if let Err(e) = self.sampling.evaluate_all_pending(&response.survey_id).await {
            warn!(survey_id = %response.survey_id, error = %e, "evaluate_all_pending failed");
        }

        Ok(())
    }
}
