pub mod repository;
pub mod repository_sqlx;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, ConfigId, InterviewerId, SurveyId, TenantId};

/// Batch lifecycle status (component B, spec.md §3/§4.B-E).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    /// Accumulating responses, not yet at capacity or sealed by the clock.
    Collecting,
    /// Sealed; sample drawn, remainder decision not yet evaluated.
    QcInProgress,
    /// Remainder decision resolved to `auto_approve`: batch fully decided
    /// without a human reviewing the remainder.
    AutoApproved,
    /// Remainder decision resolved to `send_to_qc`: the full remainder was
    /// moved into `PendingApproval` alongside the sample.
    QueuedForQc,
    /// Every response in the batch carries a terminal verification.
    Completed,
}

impl BatchStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BatchStatus::Collecting => "collecting",
            BatchStatus::QcInProgress => "qc_in_progress",
            BatchStatus::AutoApproved => "auto_approved",
            BatchStatus::QueuedForQc => "queued_for_qc",
            BatchStatus::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "collecting" => Some(BatchStatus::Collecting),
            "qc_in_progress" => Some(BatchStatus::QcInProgress),
            "auto_approved" => Some(BatchStatus::AutoApproved),
            "queued_for_qc" => Some(BatchStatus::QueuedForQc),
            "completed" => Some(BatchStatus::Completed),
            _ => None,
        }
    }
}

/// The resolved disposition of a batch's non-sampled remainder, evaluated
/// once against the approval-rule table at seal time (spec.md §4.E).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemainderDecision {
    Pending,
    AutoApprove,
    SendToQc,
    RejectAll,
}

impl RemainderDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            RemainderDecision::Pending => "pending",
            RemainderDecision::AutoApprove => "auto_approve",
            RemainderDecision::SendToQc => "send_to_qc",
            RemainderDecision::RejectAll => "reject_all",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(RemainderDecision::Pending),
            "auto_approve" => Some(RemainderDecision::AutoApprove),
            "send_to_qc" => Some(RemainderDecision::SendToQc),
            "reject_all" => Some(RemainderDecision::RejectAll),
            _ => None,
        }
    }
}

/// Running approval statistics, recomputed on every verification
/// (spec.md §4.H step 3). `approval_rate` is on the spec's 0-100
/// percentage scale: `approved / (approved + rejected) * 100`, or `0` if
/// the denominator is `0` (degenerate, e.g. a 100% sample still pending).
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize)]
pub struct QcStats {
    pub approved_count: u64,
    pub rejected_count: u64,
    pub pending_count: u64,
    pub approval_rate: f64,
}

impl QcStats {
    pub fn recompute_rate(&mut self) {
        let decided = self.approved_count + self.rejected_count;
        self.approval_rate = if decided == 0 {
            0.0
        } else {
            self.approved_count as f64 / decided as f64 * 100.0
        };
    }
}

/// A batch's snapshot of the QC Config in force when it was created
/// (spec.md §4.C step 3: batches are never retroactively reconfigured).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BatchConfigSnapshot {
    pub source_config_id: Option<ConfigId>,
    pub sample_percentage: u8,
    pub approval_rules: serde_json::Value,
}

/// One batching unit: responses from a single (survey, interviewer,
/// calendar day) tuple, per spec.md §3.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Batch {
    pub id: BatchId,
    pub tenant_id: TenantId,
    pub survey_id: SurveyId,
    pub interviewer_id: InterviewerId,
    /// The logical calendar day this batch belongs to, in the
    /// tenant-configured seal timezone (`YYYY-MM-DD`).
    pub batch_date: String,

    pub status: BatchStatus,
    pub total_responses: u64,
    pub config_snapshot: Option<BatchConfigSnapshot>,

    pub stats: QcStats,
    pub remainder_decision: RemainderDecision,
    pub remainder_decided_at: Option<DateTime<Utc>>,
    pub remainder_trigger_rate: Option<f64>,

    pub processing_started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    /// Monotonic optimistic-concurrency token (spec.md §5).
    pub version: i64,
}

impl Batch {
    pub fn is_sealed(&self) -> bool {
        !matches!(self.status, BatchStatus::Collecting)
    }

    pub fn is_full(&self, capacity: usize) -> bool {
        self.total_responses as usize >= capacity
    }
}
