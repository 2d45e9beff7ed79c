//! Deferred `upcoming → done` transitions.
//!
//! Every upcoming occurrence owns one task in the [`TaskStore`], keyed by the
//! occurrence id and due at the occurrence's end. Firing re-reads the row, so
//! duplicate, late or stale deliveries are harmless.

use std::sync::Arc;

use cadence_core::{to_db_timestamp, OwnerId};
use cadence_scheduler::{Task, TaskStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BookingError, Result},
    store::{OccurrenceFilter, OccurrenceStore},
    types::{MeetingStatus, Occurrence},
};

pub const TASK_KIND: &str = "occurrence.complete";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TransitionPayload {
    kind: String,
    owner_id: String,
    occurrence_id: String,
}

/// What a fire did to its occurrence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Completed,
    /// Gone, or owned by someone else.
    Missing,
    /// Already `done` or `canceled`.
    AlreadyResolved,
    /// End still ahead. The occurrence is left untouched and the task is
    /// re-armed at the end instant instead of being dropped.
    NotYetEnded,
}

/// Batch result of [`StatusScheduler::recover_on_startup`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecoverySummary {
    pub total: usize,
    pub armed: usize,
    pub already_armed: usize,
    pub resolved_past: usize,
    pub errors: Vec<String>,
}

pub struct StatusScheduler {
    occurrences: Arc<dyn OccurrenceStore>,
    tasks: Arc<dyn TaskStore>,
    enabled: bool,
}

impl StatusScheduler {
    pub fn new(occurrences: Arc<dyn OccurrenceStore>, tasks: Arc<dyn TaskStore>) -> Self {
        Self {
            occurrences,
            tasks,
            enabled: true,
        }
    }

    /// With scheduling disabled `arm`, `cancel` and recovery do nothing;
    /// firing still works.
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    /// Arm (or replace) the transition task for `occurrence_id`.
    pub fn arm(&self, owner: &OwnerId, occurrence_id: &str, fire_at: DateTime<Utc>) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let payload = serde_json::to_string(&TransitionPayload {
            kind: TASK_KIND.to_string(),
            owner_id: owner.as_str().to_string(),
            occurrence_id: occurrence_id.to_string(),
        })
        .map_err(|e| BookingError::TransientStore(e.to_string()))?;
        self.tasks.put(occurrence_id, fire_at, &payload)?;
        Ok(())
    }

    /// Remove the task if present. Returns whether one existed.
    pub fn cancel(&self, occurrence_id: &str) -> Result<bool> {
        if !self.enabled {
            return Ok(false);
        }
        Ok(self.tasks.remove(occurrence_id)?)
    }

    /// Make the task match the occurrence's current state: armed at its end
    /// while upcoming, absent otherwise.
    pub fn reconcile(&self, occurrence: &Occurrence) -> Result<()> {
        if occurrence.status == MeetingStatus::Upcoming {
            self.arm(&occurrence.owner_id, &occurrence.id, occurrence.end)
        } else {
            self.cancel(&occurrence.id).map(|_| ())
        }
    }

    /// [`reconcile`](Self::reconcile), logging instead of failing. Recovery
    /// re-arms anything missed here.
    pub(crate) fn reconcile_logged(&self, occurrence: &Occurrence) {
        if let Err(e) = self.reconcile(occurrence) {
            warn!(occurrence_id = %occurrence.id, "failed to sync transition task: {e}");
        }
    }

    pub(crate) fn cancel_logged(&self, occurrence_id: &str) {
        if let Err(e) = self.cancel(occurrence_id) {
            warn!(%occurrence_id, "failed to cancel transition task: {e}");
        }
    }

    /// Resolve one occurrence whose end may have passed.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn on_fire(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        now: DateTime<Utc>,
    ) -> Result<FireOutcome> {
        let Some(occurrence) = self.occurrences.get(owner, occurrence_id)? else {
            debug!("occurrence gone, nothing to complete");
            return Ok(FireOutcome::Missing);
        };
        if occurrence.end > now {
            debug!(end = %occurrence.end, "fired before end, re-arming");
            self.arm(owner, occurrence_id, occurrence.end)?;
            return Ok(FireOutcome::NotYetEnded);
        }
        if occurrence.status != MeetingStatus::Upcoming {
            return Ok(FireOutcome::AlreadyResolved);
        }
        if self.occurrences.complete_if_upcoming(owner, occurrence_id)? {
            info!("occurrence completed");
            Ok(FireOutcome::Completed)
        } else {
            Ok(FireOutcome::AlreadyResolved)
        }
    }

    /// Entry point for tasks delivered by the scheduler engine. Acknowledges
    /// the task once the occurrence has been resolved.
    pub fn handle_fired(&self, task: &Task) -> Result<FireOutcome> {
        let payload: TransitionPayload = task.payload_as()?;
        if payload.kind != TASK_KIND {
            return Err(BookingError::invalid(format!(
                "task {} has unknown kind {}",
                task.id, payload.kind
            )));
        }
        let owner = OwnerId(payload.owner_id);
        let outcome = self.on_fire(&owner, &payload.occurrence_id, Utc::now())?;
        self.tasks.mark_fired(&task.id, task.fire_at)?;
        Ok(outcome)
    }

    /// Reconcile tasks with every upcoming occurrence of every owner.
    ///
    /// Ended occurrences are completed directly; the rest are armed unless a
    /// live task already fires at their end. Per-occurrence failures are
    /// collected, never raised.
    pub fn recover_on_startup(&self, now: DateTime<Utc>) -> Result<RecoverySummary> {
        let mut summary = RecoverySummary::default();
        if !self.enabled {
            info!("scheduling disabled, skipping recovery");
            return Ok(summary);
        }

        let upcoming = self
            .occurrences
            .list(&OccurrenceFilter::any_owner().status_in([MeetingStatus::Upcoming]))?;
        summary.total = upcoming.len();

        for occurrence in &upcoming {
            if let Err(e) = self.recover_one(occurrence, now, &mut summary) {
                summary.errors.push(format!("{}: {e}", occurrence.id));
            }
        }

        info!(
            total = summary.total,
            armed = summary.armed,
            already_armed = summary.already_armed,
            resolved_past = summary.resolved_past,
            errors = summary.errors.len(),
            "schedule recovered"
        );
        Ok(summary)
    }

    fn recover_one(
        &self,
        occurrence: &Occurrence,
        now: DateTime<Utc>,
        summary: &mut RecoverySummary,
    ) -> Result<()> {
        if occurrence.end <= now {
            self.on_fire(&occurrence.owner_id, &occurrence.id, now)?;
            self.cancel(&occurrence.id)?;
            summary.resolved_past += 1;
            return Ok(());
        }

        let armed = self.tasks.get(&occurrence.id)?.is_some_and(|task| {
            task.status.is_live() && to_db_timestamp(task.fire_at) == to_db_timestamp(occurrence.end)
        });
        if armed {
            summary.already_armed += 1;
        } else {
            self.arm(&occurrence.owner_id, &occurrence.id, occurrence.end)?;
            summary.armed += 1;
        }
        Ok(())
    }
}
