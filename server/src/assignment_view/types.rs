use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{InterviewerId, ResponseId, SurveyId};
use crate::response::{Mode, Response};

/// Dispatch readiness of a row at the moment the view was last refreshed.
/// Advisory only: the Dispatcher always re-verifies the underlying
/// Response's lease and status at lease-attempt time (spec.md §5).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViewStatus {
    Available,
    Assigned,
    Expired,
}

/// One materialized row of the Assignment View (spec.md §3, component F):
/// a `Pending_Approval` response that is either part of its batch's
/// sample or whose batch has fully queued for QC.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AssignmentRow {
    pub response_id: ResponseId,
    pub survey_id: SurveyId,
    pub interviewer_id: InterviewerId,
    pub mode: Mode,
    pub selected_ac: Option<String>,
    /// Dispatch tie-break ahead of `lastSkippedAt`/`createdAt`. The
    /// source spec names this field but never defines how it is
    /// populated; every row gets the same value until a prioritization
    /// policy is introduced (see DESIGN.md).
    pub priority: i32,
    pub last_skipped_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub view_status: ViewStatus,
}

impl AssignmentRow {
    pub fn from_response(r: &Response) -> Self {
        Self {
            response_id: r.id,
            survey_id: r.survey_id.clone(),
            interviewer_id: r.interviewer_id.clone(),
            mode: r.mode,
            selected_ac: r.selected_ac.clone(),
            priority: 0,
            last_skipped_at: r.last_skipped_at,
            created_at: r.created_at,
            view_status: if r.lease.as_ref().is_some_and(|l| l.expires_at > crate::time::now()) {
                ViewStatus::Assigned
            } else {
                ViewStatus::Available
            },
        }
    }
}
