use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

use crate::assignment_view::AssignmentView;
use crate::batch::repository::BatchRepository;
use crate::config::AppConfig;
use crate::logger::warn_if_slow;
use crate::qc_config::repository::QcConfigRepository;
use crate::response::repository::ResponseRepository;
use crate::sampling::SamplingEngine;

/// How often the daily-seal sweep runs. The sweep itself is idempotent
/// (it re-checks `batch_date < today` each time), so an hourly cadence
/// is a liveness margin around the `DAILY_SEAL_TZ` boundary rather than
/// something that must land exactly at midnight.
const DAILY_SEAL_POLL_SEC: u64 = 3600;

/// Component I (spec.md §4.I): three independent periodic sweeps that
/// keep the system converging even when no request happens to trigger
/// the opportunistic paths in components D/E/H.
///
/// Each sweep is guarded by a per-task `try_lock`, mirroring the
/// teacher's single-flight scheduling tick: an overlapping tick (the
/// previous one running long) is skipped rather than queued, so work
/// never stacks up behind a slow sweep.
pub struct Scheduler<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    responses: Arc<RR>,
    batches: Arc<BR>,
    sampling: Arc<SamplingEngine<RR, BR, CR>>,
    view: AssignmentView,
    config: Arc<AppConfig>,

    daily_seal_lock: Arc<Mutex<()>>,
    view_refresh_lock: Arc<Mutex<()>>,
    lease_gc_lock: Arc<Mutex<()>>,
}

impl<RR, BR, CR> Clone for Scheduler<RR, BR, CR>
where
    RR: ResponseRepository,
    BR: BatchRepository,
    CR: QcConfigRepository,
{
    fn clone(&self) -> Self {
        Self {
            responses: self.responses.clone(),
            batches: self.batches.clone(),
            sampling: self.sampling.clone(),
            view: self.view.clone(),
            config: self.config.clone(),
            daily_seal_lock: self.daily_seal_lock.clone(),
            view_refresh_lock: self.view_refresh_lock.clone(),
            lease_gc_lock: self.lease_gc_lock.clone(),
        }
    }
}

impl<RR, BR, CR> Scheduler<RR, BR, CR>
where
    RR: ResponseRepository + 'static,
    BR: BatchRepository + 'static,
    CR: QcConfigRepository + 'static,
{
    pub fn new(
        responses: Arc<RR>,
        batches: Arc<BR>,
        sampling: Arc<SamplingEngine<RR, BR, CR>>,
        view: AssignmentView,
        config: Arc<AppConfig>,
    ) -> Self {
        Self {
            responses,
            batches,
            sampling,
            view,
            config,
            daily_seal_lock: Arc::new(Mutex::new(())),
            view_refresh_lock: Arc::new(Mutex::new(())),
            lease_gc_lock: Arc::new(Mutex::new(())),
        }
    }

    /// Spawns the three background loops. Returns immediately; the
    /// loops run for the lifetime of the process, same shape as the
    /// teacher's `start_scheduler_loop`.
    pub fn spawn(&self) {
        self.spawn_daily_seal_loop();
        self.spawn_view_refresh_loop();
        self.spawn_lease_gc_loop();
    }

    fn spawn_daily_seal_loop(&self) {
        let this = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(DAILY_SEAL_POLL_SEC));
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_daily_seal_once().await {
                    warn!(error = %e, "daily seal sweep failed");
                }
            }
        });
    }

    fn spawn_view_refresh_loop(&self) {
        let this = self.clone();
        let period = Duration::from_secs(self.config.view_refresh_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_view_refresh_once().await {
                    warn!(error = %e, "assignment view refresh failed");
                }
            }
        });
    }

    fn spawn_lease_gc_loop(&self) {
        let this = self.clone();
        let period = Duration::from_secs(self.config.lease_gc_interval_sec.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                if let Err(e) = this.run_lease_gc_once().await {
                    warn!(error = %e, "lease GC sweep failed");
                }
            }
        });
    }

    /// Seals every `Collecting` batch whose `batch_date` precedes today
    /// (spec.md §4.I), then re-evaluates the remainder decision for
    /// every `QcInProgress` batch across all surveys — covering batches
    /// this sweep just sealed as well as ones left pending by an
    /// earlier tick that never got an opportunistic re-check. Also
    /// exposed for the `/batches/process` admin trigger.
    #[instrument(skip(self), target = "scheduler")]
    pub async fn run_daily_seal_once(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.daily_seal_lock.try_lock() else {
            debug!("daily seal sweep already running; skipping this tick");
            return Ok(());
        };

        let today = crate::time::logical_day(&self.config.daily_seal_tz);
        let stale = warn_if_slow(
            "fetch_collecting_before",
            Duration::from_millis(200),
            self.batches.fetch_collecting_before(&today),
        )
        .await?;

        for batch in &stale {
            if let Err(e) = self.sampling.seal_batch(&batch.id).await {
                warn!(batch_id = %batch.id, error = %e, "daily seal failed for batch");
            }
        }

        let pending = self.batches.fetch_all_qc_in_progress().await?;
        let surveys: HashSet<_> = pending.iter().map(|b| b.survey_id.clone()).collect();
        for survey_id in surveys {
            if let Err(e) = self.sampling.evaluate_all_pending(&survey_id).await {
                warn!(survey_id = %survey_id.0, error = %e, "remainder evaluation sweep failed");
            }
        }

        debug!(sealed = stale.len(), "daily seal sweep complete");
        Ok(())
    }

    /// Rebuilds the Assignment View from source-of-truth.
    #[instrument(skip(self), target = "scheduler")]
    pub async fn run_view_refresh_once(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.view_refresh_lock.try_lock() else {
            debug!("view refresh already running; skipping this tick");
            return Ok(());
        };

        let kept = warn_if_slow(
            "assignment_view_refresh",
            Duration::from_millis(500),
            self.view.refresh(self.responses.as_ref(), self.batches.as_ref()),
        )
        .await?;
        debug!(kept, "assignment view refresh complete");
        Ok(())
    }

    /// Clears leases whose `lease_expires_at` has passed, restoring
    /// their responses to dispatchable.
    #[instrument(skip(self), target = "scheduler")]
    pub async fn run_lease_gc_once(&self) -> anyhow::Result<()> {
        let Ok(_guard) = self.lease_gc_lock.try_lock() else {
            debug!("lease GC already running; skipping this tick");
            return Ok(());
        };

        let cleared = self.responses.clear_expired_leases(crate::time::now()).await?;
        if cleared > 0 {
            debug!(cleared, "expired leases cleared");
        }
        Ok(())
    }
}
