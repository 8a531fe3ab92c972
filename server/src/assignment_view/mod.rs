pub mod types;

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::debug;

use crate::assignment_view::types::AssignmentRow;
use crate::batch::repository::BatchRepository;
use crate::ids::ResponseId;
use crate::response::repository::ResponseRepository;
use crate::response::Mode;

const REFRESH_PAGE_SIZE: usize = 500;

/// Materialized view of currently available-for-review responses
/// (component F, spec.md §4.F). Kept fresh by the scheduler's periodic
/// refresh and invalidated opportunistically after verdicts and batch
/// transitions; the Dispatcher reads it for ordering only, never as the
/// source of truth for lease state.
#[derive(Clone, Default)]
pub struct AssignmentView {
    rows: Arc<RwLock<HashMap<ResponseId, AssignmentRow>>>,
}

impl AssignmentView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the view from source-of-truth, paging through
    /// `fetch_dispatchable` in small batches so the refresh never holds
    /// a long-lived lock (spec.md §5). Rows that no longer qualify
    /// (verified, abandoned, or whose batch turned terminal) are
    /// dropped at the end of the sweep.
    pub async fn refresh<RR, BR>(&self, responses: &RR, batches: &BR) -> anyhow::Result<usize>
    where
        RR: ResponseRepository,
        BR: BatchRepository,
    {
        let queued = batches.fetch_queued_for_qc_ids().await?;

        let mut seen = HashSet::new();
        let mut offset = 0;
        loop {
            let page = responses
                .fetch_dispatchable(&queued, REFRESH_PAGE_SIZE, offset)
                .await?;
            let page_len = page.len();
            for r in &page {
                seen.insert(r.id);
                self.upsert(AssignmentRow::from_response(r)).await;
            }
            if page_len < REFRESH_PAGE_SIZE {
                break;
            }
            offset += REFRESH_PAGE_SIZE;
        }

        let mut rows = self.rows.write().await;
        let before = rows.len();
        rows.retain(|id, _| seen.contains(id));
        let dropped = before.saturating_sub(rows.len());
        let kept = rows.len();
        drop(rows);

        debug!(kept, dropped, "assignment view refreshed");
        Ok(kept)
    }

    /// Upserts a single row, used both by `refresh` and by the
    /// opportunistic invalidation path after a verdict or batch seal.
    pub async fn upsert(&self, row: AssignmentRow) {
        self.rows.write().await.insert(row.response_id, row);
    }

    /// Removes a row once its response is no longer dispatchable
    /// (verified, skipped into a terminal state, or leased out of the
    /// pool is NOT a reason to remove — only terminal transitions are).
    pub async fn remove(&self, id: &ResponseId) {
        self.rows.write().await.remove(id);
    }

    pub async fn len(&self) -> usize {
        self.rows.read().await.len()
    }

    /// Ordered candidates for `NextAssignment`: filtered by `mode` (if
    /// supplied) and excluding `exclude_id`, ordered `priority ASC,
    /// lastSkippedAt ASC NULLS FIRST, createdAt ASC` (spec.md §4.G step
    /// 1-3).
    pub async fn candidates(
        &self,
        mode: Option<Mode>,
        exclude_id: Option<ResponseId>,
    ) -> Vec<AssignmentRow> {
        let rows = self.rows.read().await;
        let mut out: Vec<_> = rows
            .values()
            .filter(|r| mode.is_none_or(|m| r.mode == m))
            .filter(|r| exclude_id.is_none_or(|ex| r.response_id != ex))
            .cloned()
            .collect();
        drop(rows);

        out.sort_by(|a, b| {
            a.priority
                .cmp(&b.priority)
                .then_with(|| cmp_last_skipped(a.last_skipped_at, b.last_skipped_at))
                .then_with(|| a.created_at.cmp(&b.created_at))
        });
        out
    }
}

/// `lastSkippedAt ASC NULLS FIRST`: rows never skipped sort ahead of
/// rows that have been skipped, which in turn sort by oldest skip first.
fn cmp_last_skipped(
    a: Option<chrono::DateTime<chrono::Utc>>,
    b: Option<chrono::DateTime<chrono::Utc>>,
) -> Ordering {
    match (a, b) {
        (None, None) => Ordering::Equal,
        (None, Some(_)) => Ordering::Less,
        (Some(_), None) => Ordering::Greater,
        (Some(x), Some(y)) => x.cmp(&y),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assignment_view::types::ViewStatus;
    use crate::ids::{InterviewerId, SurveyId};
    use chrono::Utc;

    fn row(id: ResponseId, mode: Mode, last_skipped_at: Option<chrono::DateTime<Utc>>, created_at: chrono::DateTime<Utc>) -> AssignmentRow {
        AssignmentRow {
            response_id: id,
            survey_id: SurveyId("s1".into()),
            interviewer_id: InterviewerId("i1".into()),
            mode,
            selected_ac: None,
            priority: 0,
            last_skipped_at,
            created_at,
            view_status: ViewStatus::Available,
        }
    }

    #[tokio::test]
    async fn never_skipped_rows_sort_ahead_of_skipped_ones() {
        let view = AssignmentView::new();
        let now = Utc::now();

        let skipped = ResponseId::new();
        let fresh = ResponseId::new();
        view.upsert(row(skipped, Mode::Capi, Some(now), now)).await;
        view.upsert(row(fresh, Mode::Capi, None, now)).await;

        let candidates = view.candidates(None, None).await;
        assert_eq!(candidates[0].response_id, fresh);
        assert_eq!(candidates[1].response_id, skipped);
    }

    #[tokio::test]
    async fn mode_filter_excludes_non_matching_rows() {
        let view = AssignmentView::new();
        let now = Utc::now();
        let capi = ResponseId::new();
        let cati = ResponseId::new();
        view.upsert(row(capi, Mode::Capi, None, now)).await;
        view.upsert(row(cati, Mode::Cati, None, now)).await;

        let candidates = view.candidates(Some(Mode::Cati), None).await;
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].response_id, cati);
    }

    #[tokio::test]
    async fn excluded_id_is_never_returned() {
        let view = AssignmentView::new();
        let now = Utc::now();
        let id = ResponseId::new();
        view.upsert(row(id, Mode::Capi, None, now)).await;

        let candidates = view.candidates(None, Some(id)).await;
        assert!(candidates.is_empty());
    }
}
