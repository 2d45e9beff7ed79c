//! Edits and deletions fanned out over a pattern's occurrences.
//!
//! | scope             | occurrences touched                          |
//! |-------------------|----------------------------------------------|
//! | `this_only`       | the target                                   |
//! | `this_and_future` | target + siblings with `start >= target.start` |
//! | `all`             | every occurrence of the pattern              |
//!
//! Bulk time edits skip siblings that were already moved away from the
//! pattern's slot (drift filter) and shift the others by the same offset the
//! target moved from its canonical slot. Edits that leave the times alone
//! reach every sibling in scope, and so do deletes.

use std::sync::Arc;

use cadence_core::OwnerId;
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BookingError, Result},
    status::StatusScheduler,
    store::{OccurrenceFilter, OccurrenceStore, PatternStore},
    types::{
        validate_interval, Occurrence, OccurrencePatch, PatternPatch, RecurrencePattern, Scope,
        TimeSlot,
    },
};

#[derive(Debug, Clone, Serialize)]
pub struct SiblingFailure {
    pub occurrence_id: String,
    pub error: String,
}

/// Per-sibling outcome of a scoped operation, in ascending start order.
#[derive(Debug, Clone, Serialize)]
pub struct ScopeReport<T> {
    pub succeeded: Vec<T>,
    /// Ids left alone: drifted siblings, or rows that vanished mid-operation.
    pub skipped: Vec<String>,
    pub failures: Vec<SiblingFailure>,
}

impl<T> Default for ScopeReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            skipped: Vec::new(),
            failures: Vec::new(),
        }
    }
}

impl<T> ScopeReport<T> {
    fn single(item: T) -> Self {
        Self {
            succeeded: vec![item],
            ..Default::default()
        }
    }

    pub fn has_failures(&self) -> bool {
        !self.failures.is_empty()
    }

    fn fail(&mut self, occurrence_id: &str, error: BookingError) {
        warn!(%occurrence_id, "scoped operation failed for sibling: {error}");
        self.failures.push(SiblingFailure {
            occurrence_id: occurrence_id.to_string(),
            error: error.to_string(),
        });
    }

    /// Whole-operation failure when nothing succeeded but something failed.
    fn into_result(self) -> Result<Self> {
        if self.succeeded.is_empty() {
            if let Some(first) = self.failures.first() {
                return Err(BookingError::ScopeFailed {
                    failed: self.failures.len(),
                    first: first.error.clone(),
                });
            }
        }
        Ok(self)
    }
}

/// Offsets of the target's new times from its canonical slot.
#[derive(Debug, Clone, Copy, Default)]
struct SlotShift {
    start: Option<Duration>,
    end: Option<Duration>,
}

impl SlotShift {
    fn is_empty(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    /// New times for a sibling: its own times moved by the offsets.
    fn apply(&self, sibling: &Occurrence) -> (Option<DateTime<Utc>>, Option<DateTime<Utc>>) {
        (
            self.start.map(|d| sibling.start + d),
            self.end.map(|d| sibling.end + d),
        )
    }

    /// The slot on `date`, moved. Fails when the moved slot would not end
    /// after it starts.
    fn check(&self, slot: &TimeSlot, date: NaiveDate) -> Result<()> {
        let (start, end) = slot.on(date);
        validate_interval(
            start + self.start.unwrap_or_else(Duration::zero),
            end + self.end.unwrap_or_else(Duration::zero),
        )
    }
}

pub struct ScopedMutationEngine {
    patterns: Arc<dyn PatternStore>,
    occurrences: Arc<dyn OccurrenceStore>,
    scheduler: Arc<StatusScheduler>,
    drift_tolerance: Duration,
}

impl ScopedMutationEngine {
    pub fn new(
        patterns: Arc<dyn PatternStore>,
        occurrences: Arc<dyn OccurrenceStore>,
        scheduler: Arc<StatusScheduler>,
        drift_tolerance: Duration,
    ) -> Self {
        Self {
            patterns,
            occurrences,
            scheduler,
            drift_tolerance,
        }
    }

    /// Apply `patch` to one occurrence and sync its transition task.
    #[instrument(skip(self, patch), fields(owner = %owner))]
    pub fn update_one(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        patch: &OccurrencePatch,
    ) -> Result<Occurrence> {
        let updated = self
            .occurrences
            .update(owner, occurrence_id, patch)?
            .ok_or_else(|| BookingError::not_found("occurrence", occurrence_id))?;
        if patch.touches_schedule() {
            self.scheduler.reconcile_logged(&updated);
        }
        Ok(updated)
    }

    /// Cancel the task, then delete the row.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn delete_one(&self, owner: &OwnerId, occurrence_id: &str) -> Result<()> {
        if self.occurrences.get(owner, occurrence_id)?.is_none() {
            return Err(BookingError::not_found("occurrence", occurrence_id));
        }
        self.scheduler.cancel_logged(occurrence_id);
        if !self.occurrences.delete(owner, occurrence_id)? {
            return Err(BookingError::not_found("occurrence", occurrence_id));
        }
        debug!("occurrence deleted");
        Ok(())
    }

    #[instrument(skip(self, patch), fields(owner = %owner, %scope))]
    pub fn update_scoped(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        patch: &OccurrencePatch,
        scope: Scope,
    ) -> Result<ScopeReport<Occurrence>> {
        patch.validate()?;
        let target = self
            .occurrences
            .get(owner, occurrence_id)?
            .ok_or_else(|| BookingError::not_found("occurrence", occurrence_id))?;
        let target_end_state = (
            patch.start.unwrap_or(target.start),
            patch.end.unwrap_or(target.end),
        );
        validate_interval(target_end_state.0, target_end_state.1)?;

        let pattern = match (&target.pattern_id, scope) {
            (Some(pattern_id), Scope::ThisAndFuture | Scope::All) => self
                .patterns
                .get(owner, pattern_id)?
                .ok_or_else(|| BookingError::not_found("pattern", pattern_id.as_str()))?,
            _ => return self.update_one(owner, occurrence_id, patch).map(ScopeReport::single),
        };
        // Everything below compares against the slot as it was before this edit.
        let slot = pattern.slot;
        let shift = self.shift_for(&slot, &target, patch);
        shift.check(&slot, target.start.date_naive())?;

        let siblings = self.siblings(owner, &pattern, &target, scope)?;
        let rest = patch.without_times();
        let time_edit = patch.touches_time();
        let mut report = ScopeReport::default();

        for sibling in &siblings {
            let sibling_patch = if sibling.id == target.id {
                patch.clone()
            } else if time_edit && !self.on_slot(&slot, sibling) {
                debug!(occurrence_id = %sibling.id, "sibling drifted from pattern slot, skipping");
                report.skipped.push(sibling.id.clone());
                continue;
            } else {
                let (start, end) = shift.apply(sibling);
                OccurrencePatch {
                    start,
                    end,
                    ..rest.clone()
                }
            };

            match self.occurrences.update(owner, &sibling.id, &sibling_patch) {
                Ok(Some(updated)) => {
                    if sibling_patch.touches_schedule() {
                        self.scheduler.reconcile_logged(&updated);
                    }
                    report.succeeded.push(updated);
                }
                Ok(None) => report.skipped.push(sibling.id.clone()),
                Err(e) => report.fail(&sibling.id, e),
            }
        }

        if !shift.is_empty() && !report.succeeded.is_empty() {
            self.move_pattern_slot(owner, &pattern, &target, shift);
        }

        info!(
            succeeded = report.succeeded.len(),
            skipped = report.skipped.len(),
            failed = report.failures.len(),
            "scoped update applied"
        );
        report.into_result()
    }

    /// Delete every occurrence in scope, each task first. No drift filter.
    #[instrument(skip(self), fields(owner = %owner, %scope))]
    pub fn delete_scoped(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        scope: Scope,
    ) -> Result<ScopeReport<String>> {
        let target = self
            .occurrences
            .get(owner, occurrence_id)?
            .ok_or_else(|| BookingError::not_found("occurrence", occurrence_id))?;

        let pattern = match (&target.pattern_id, scope) {
            (Some(pattern_id), Scope::ThisAndFuture | Scope::All) => self
                .patterns
                .get(owner, pattern_id)?
                .ok_or_else(|| BookingError::not_found("pattern", pattern_id.as_str()))?,
            _ => {
                self.delete_one(owner, occurrence_id)?;
                return Ok(ScopeReport::single(target.id));
            }
        };

        let siblings = self.siblings(owner, &pattern, &target, scope)?;
        let mut report = ScopeReport::default();
        for sibling in &siblings {
            self.scheduler.cancel_logged(&sibling.id);
            match self.occurrences.delete(owner, &sibling.id) {
                Ok(true) => report.succeeded.push(sibling.id.clone()),
                Ok(false) => report.skipped.push(sibling.id.clone()),
                Err(e) => report.fail(&sibling.id, e),
            }
        }
        info!(
            deleted = report.succeeded.len(),
            failed = report.failures.len(),
            "scoped delete applied"
        );
        report.into_result()
    }

    fn siblings(
        &self,
        owner: &OwnerId,
        pattern: &RecurrencePattern,
        target: &Occurrence,
        scope: Scope,
    ) -> Result<Vec<Occurrence>> {
        let mut filter = OccurrenceFilter::for_owner(owner).pattern(pattern.id.clone());
        if scope == Scope::ThisAndFuture {
            filter = filter.starting_from(target.start);
        }
        self.occurrences.list(&filter)
    }

    /// Offsets from the target's canonical slot. A side that is unedited, or
    /// set to the value it already has, contributes no offset.
    fn shift_for(&self, slot: &TimeSlot, target: &Occurrence, patch: &OccurrencePatch) -> SlotShift {
        let (cs, ce) = slot.on(target.start.date_naive());
        SlotShift {
            start: patch.start.filter(|s| *s != target.start).map(|s| s - cs),
            end: patch.end.filter(|e| *e != target.end).map(|e| e - ce),
        }
    }

    /// Whether both ends sit strictly within the drift tolerance of the slot.
    fn on_slot(&self, slot: &TimeSlot, occurrence: &Occurrence) -> bool {
        let (cs, ce) = slot.on(occurrence.start.date_naive());
        (occurrence.start - cs).abs() < self.drift_tolerance
            && (occurrence.end - ce).abs() < self.drift_tolerance
    }

    /// Best effort: siblings stay updated if this fails.
    fn move_pattern_slot(
        &self,
        owner: &OwnerId,
        pattern: &RecurrencePattern,
        target: &Occurrence,
        shift: SlotShift,
    ) {
        let (cs, ce) = pattern.slot.on(target.start.date_naive());
        let patch = PatternPatch {
            start_time: shift.start.map(|d| (cs + d).time()),
            end_time: shift.end.map(|d| (ce + d).time()),
            ..Default::default()
        };
        match self.patterns.update(owner, &pattern.id, &patch) {
            Ok(Some(_)) => debug!(pattern_id = %pattern.id, "pattern slot moved"),
            Ok(None) => warn!(pattern_id = %pattern.id, "pattern vanished before slot update"),
            Err(e) => warn!(pattern_id = %pattern.id, "failed to move pattern slot: {e}"),
        }
    }
}
