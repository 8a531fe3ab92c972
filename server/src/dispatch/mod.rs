use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tracing::{debug, warn};

use crate::assignment_view::AssignmentView;
use crate::assignment_view::types::AssignmentRow;
use crate::config::AppConfig;
use crate::error::{AppError, AppResult};
use crate::ids::{AgentId, ResponseId};
use crate::response::repository::ResponseRepository;
use crate::response::{Mode, Response};

/// The result of a successful `NextAssignment` call (spec.md §4.G): the
/// leased response plus the wall-clock instant the lease lapses.
#[derive(Clone, Debug)]
pub struct Assignment {
    pub response: Response,
    pub expires_at: DateTime<Utc>,
}

/// Component G: leases a single Response to a requesting quality agent
/// with at-most-one concurrency, mode filtering, skip/release semantics,
/// and bounded lease duration (spec.md §4.G).
///
/// The Assignment View is read for ordering only; every lease attempt
/// re-verifies the underlying Response against the repository, never
/// trusting the view's possibly-stale `view_status` (spec.md §5).
pub struct Dispatcher<RR: ResponseRepository> {
    responses: Arc<RR>,
    view: AssignmentView,
    config: Arc<AppConfig>,
}

impl<RR: ResponseRepository> Dispatcher<RR> {
    pub fn new(responses: Arc<RR>, view: AssignmentView, config: Arc<AppConfig>) -> Self {
        Self {
            responses,
            view,
            config,
        }
    }

    /// `NextAssignment(agentId, {mode?, excludeResponseId?})` (spec.md
    /// §4.G, single-round algorithm steps 1-5). Tries candidates in
    /// Assignment View order, attempting a conditional lease write on
    /// each, up to `max_dispatch_retries` before giving up and returning
    /// `None`.
    pub async fn next_assignment(
        &self,
        agent: &AgentId,
        mode: Option<Mode>,
        exclude_response_id: Option<ResponseId>,
    ) -> AppResult<Option<Assignment>> {
        let candidates = self.view.candidates(mode, exclude_response_id).await;

        let now = crate::time::now();
        let expires_at = now + ChronoDuration::minutes(self.config.lease_duration_min);

        let mut attempted = 0usize;
        for candidate in candidates {
            if attempted >= self.config.max_dispatch_retries {
                break;
            }
            attempted += 1;

            if let Some(assignment) = self
                .try_lease_candidate(&candidate, agent, now, expires_at)
                .await?
            {
                return Ok(Some(assignment));
            }
        }

        debug!(agent = %agent, attempted, "no candidate could be leased this round");
        Ok(None)
    }

    async fn try_lease_candidate(
        &self,
        candidate: &AssignmentRow,
        agent: &AgentId,
        now: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> AppResult<Option<Assignment>> {
        let acquired = self
            .responses
            .try_acquire_lease(&candidate.response_id, agent, now, expires_at)
            .await
            .map_err(AppError::Other)?;

        if !acquired {
            // Lost the race, or the row is already stale (verified /
            // abandoned since the view was last refreshed). Either way,
            // this candidate is not available; move to the next one.
            return Ok(None);
        }

        let Some(response) = self
            .responses
            .fetch_by_id(&candidate.response_id)
            .await
            .map_err(AppError::Other)?
        else {
            // Response vanished between the CAS and the re-read. Treat as
            // a benign miss rather than an invariant violation: nothing
            // was leaked since the lease row no longer exists either.
            warn!(response_id = %candidate.response_id, "leased response disappeared before re-read");
            return Ok(None);
        };

        let mut row = candidate.clone();
        row.view_status = crate::assignment_view::types::ViewStatus::Assigned;
        self.view.upsert(row).await;

        Ok(Some(Assignment {
            response,
            expires_at,
        }))
    }

    /// `ReleaseAssignment(agentId, responseId)`: a silent no-op on an
    /// unknown or foreign lease (spec.md §4.G failure modes). Always
    /// returns `Ok(())`.
    pub async fn release_assignment(
        &self,
        agent: &AgentId,
        response_id: &ResponseId,
    ) -> AppResult<()> {
        self.responses
            .release_lease(response_id, agent)
            .await
            .map_err(AppError::Other)?;

        if let Some(response) = self
            .responses
            .fetch_by_id(response_id)
            .await
            .map_err(AppError::Other)?
        {
            self.view.upsert(AssignmentRow::from_response(&response)).await;
        }

        Ok(())
    }

    /// `SkipAssignment(agentId, responseId)`: releases the lease and
    /// stamps `lastSkippedAt = now`, demoting the response on subsequent
    /// dispatch ordering. Rejected with `Forbidden` if the caller does
    /// not currently hold the lease (spec.md §4.G).
    pub async fn skip_assignment(
        &self,
        agent: &AgentId,
        response_id: &ResponseId,
    ) -> AppResult<()> {
        let now = crate::time::now();
        let ok = self
            .responses
            .skip(response_id, agent, now)
            .await
            .map_err(AppError::Other)?;

        if !ok {
            return Err(AppError::Forbidden(format!(
                "agent {agent} does not hold the lease on response {response_id}"
            )));
        }

        if let Some(response) = self
            .responses
            .fetch_by_id(response_id)
            .await
            .map_err(AppError::Other)?
        {
            self.view.upsert(AssignmentRow::from_response(&response)).await;
        }

        Ok(())
    }
}
