pub mod repository;
pub mod repository_sqlx;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, BatchId, InterviewerId, ResponseId, SurveyId};

/// Interview channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Capi,
    Cati,
}

impl Mode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Mode::Capi => "capi",
            Mode::Cati => "cati",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "capi" => Some(Mode::Capi),
            "cati" => Some(Mode::Cati),
            _ => None,
        }
    }
}

/// Response lifecycle status. Canonical casing resolution for Open
/// Question (i) in spec.md §9: PascalCase in Rust, `snake_case` on the
/// wire, exactly one representation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Submitted,
    PendingApproval,
    Approved,
    Rejected,
    Abandoned,
}

impl ResponseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResponseStatus::Submitted => "submitted",
            ResponseStatus::PendingApproval => "pending_approval",
            ResponseStatus::Approved => "approved",
            ResponseStatus::Rejected => "rejected",
            ResponseStatus::Abandoned => "abandoned",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(ResponseStatus::Submitted),
            "pending_approval" => Some(ResponseStatus::PendingApproval),
            "approved" => Some(ResponseStatus::Approved),
            "rejected" => Some(ResponseStatus::Rejected),
            "abandoned" => Some(ResponseStatus::Abandoned),
            _ => None,
        }
    }
}

/// Reviewer verdict, as submitted by a quality agent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Approve,
    Reject,
}

/// Verification outcome attached to a Response once it leaves
/// `PendingApproval`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verification {
    pub reviewer: Option<AgentId>,
    pub decided_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub feedback: String,
    pub auto_approved: bool,
    pub auto_rejected: bool,
    pub triggering_batch_id: BatchId,
}

/// A single leased hold on a Response by one quality agent.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Lease {
    pub leased_to: AgentId,
    pub leased_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Lease {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }
}

/// A single completed survey interview submitted by an interviewer.
///
/// `metadata` is an opaque pass-through blob (location, assembly
/// constituency tag, question/answer payload, ...); the core never
/// inspects it beyond the indexed columns below.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Response {
    pub id: ResponseId,
    pub tenant_id: crate::ids::TenantId,
    pub survey_id: SurveyId,
    pub interviewer_id: InterviewerId,
    pub mode: Mode,
    pub selected_ac: Option<String>,
    pub created_at: DateTime<Utc>,

    pub status: ResponseStatus,
    pub is_sample_response: bool,
    pub batch_ref: Option<BatchId>,
    pub verification: Option<Verification>,

    pub lease: Option<Lease>,
    pub last_skipped_at: Option<DateTime<Utc>>,

    pub metadata: serde_json::Value,
}

impl Response {
    /// Preconditions for `OnResponseSubmitted` (spec.md §4.D): must exist
    /// with `Submitted` status, not `Abandoned`, not already batched.
    pub fn is_batchable(&self) -> bool {
        self.status == ResponseStatus::Submitted
            && self.batch_ref.is_none()
            && self.status != ResponseStatus::Abandoned
    }
}
