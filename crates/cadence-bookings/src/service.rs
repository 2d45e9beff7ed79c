use std::sync::Arc;

use cadence_core::{CadenceConfig, OwnerId};
use cadence_scheduler::{Task, TaskStore};
use chrono::{Duration, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::{BookingError, Result},
    materialize::{materialize, DateRange},
    quota::{Allocation, QuotaAllocator},
    scoped::{ScopeReport, ScopedMutationEngine},
    status::{FireOutcome, RecoverySummary, StatusScheduler},
    store::{OccurrenceFilter, Stores},
    types::{
        Occurrence, OccurrenceDraft, OccurrencePatch, PatternPatch, PatternRequest, Quota,
        QuotaRequest, QuotaStatus, RecurrencePattern, Scope,
    },
};

/// Quota state attached to a creation result.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaReport {
    pub quota_id: String,
    pub total_credits: u32,
    pub done: u32,
    pub scheduled: u32,
    pub available: u32,
    pub price_per_credit: f64,
    /// Occurrences the pattern would have produced without the cap.
    pub requested: usize,
    /// The cap truncated the series.
    pub limited: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecurrenceCreated {
    pub pattern: RecurrencePattern,
    pub created_count: usize,
    /// Drafts that could not be persisted. They are logged and skipped.
    pub failed_count: usize,
    pub quota: Option<QuotaReport>,
}

/// Entry point for every booking operation.
pub struct BookingService {
    stores: Stores,
    allocator: QuotaAllocator,
    scheduler: Arc<StatusScheduler>,
    scoped: ScopedMutationEngine,
    horizon_days: u32,
}

impl BookingService {
    pub fn new(stores: Stores, tasks: Arc<dyn TaskStore>, config: &CadenceConfig) -> Self {
        let scheduler = Arc::new(
            StatusScheduler::new(stores.occurrences.clone(), tasks)
                .with_enabled(config.scheduler.enabled),
        );
        let scoped = ScopedMutationEngine::new(
            stores.patterns.clone(),
            stores.occurrences.clone(),
            scheduler.clone(),
            Duration::seconds(config.bookings.drift_tolerance_secs),
        );
        let allocator = QuotaAllocator::new(stores.quotas.clone(), stores.occurrences.clone());
        Self {
            stores,
            allocator,
            scheduler,
            scoped,
            horizon_days: config.bookings.open_ended_horizon_days,
        }
    }

    pub fn scheduler(&self) -> &StatusScheduler {
        &self.scheduler
    }

    pub fn allocate_quota(
        &self,
        owner: &OwnerId,
        client_id: &str,
        wants_quota: bool,
    ) -> Result<Allocation> {
        self.allocator
            .allocate(owner, client_id, wants_quota, Utc::now())
    }

    // ── Recurrences ─────────────────────────────────────────────────────────

    /// Persist a pattern and its occurrences, capped by the client's quota
    /// when `request.use_quota` is set.
    #[instrument(skip(self, request), fields(owner = %owner, client = %request.client_id))]
    pub fn create_recurrence(
        &self,
        owner: &OwnerId,
        request: &PatternRequest,
    ) -> Result<RecurrenceCreated> {
        let slot = request.validate()?;
        let allocation = self.allocate_quota(owner, &request.client_id, request.use_quota)?;
        let pattern = self.stores.patterns.create(owner, request, slot)?;

        let mut drafts = materialize(&pattern, DateRange::for_pattern(&pattern, self.horizon_days));
        let requested = drafts.len();
        if let Some(grant) = allocation.grant() {
            drafts.truncate(grant.available as usize);
            for draft in &mut drafts {
                draft.quota_id = Some(grant.quota.id.clone());
                draft.hourly_rate = grant.override_rate;
            }
        }

        let mut created_count = 0;
        let mut failed_count = 0;
        for draft in &drafts {
            match self.persist(owner, draft) {
                Ok(_) => created_count += 1,
                Err(e) => {
                    warn!(start = %draft.start, "failed to create occurrence: {e}");
                    failed_count += 1;
                }
            }
        }

        let quota = allocation.grant().map(|grant| {
            let scheduled = grant.usage.scheduled + created_count as u32;
            QuotaReport {
                quota_id: grant.quota.id.clone(),
                total_credits: grant.quota.total_credits,
                done: grant.usage.done,
                scheduled,
                available: grant
                    .quota
                    .total_credits
                    .saturating_sub(grant.usage.done + scheduled),
                price_per_credit: grant.quota.price_per_credit,
                requested,
                limited: requested > grant.available as usize,
            }
        });
        if quota.as_ref().is_some_and(|q| q.limited) {
            info!(requested, created_count, "series truncated by quota");
        }

        info!(pattern_id = %pattern.id, created_count, failed_count, "recurrence created");
        Ok(RecurrenceCreated {
            pattern,
            created_count,
            failed_count,
            quota,
        })
    }

    pub fn get_pattern(&self, owner: &OwnerId, pattern_id: &str) -> Result<RecurrencePattern> {
        self.stores
            .patterns
            .get(owner, pattern_id)?
            .ok_or_else(|| BookingError::not_found("pattern", pattern_id))
    }

    pub fn list_patterns(&self, owner: &OwnerId) -> Result<Vec<RecurrencePattern>> {
        self.stores.patterns.list(owner)
    }

    pub fn list_pattern_occurrences(
        &self,
        owner: &OwnerId,
        pattern_id: &str,
    ) -> Result<Vec<Occurrence>> {
        self.get_pattern(owner, pattern_id)?;
        self.stores
            .occurrences
            .list(&OccurrenceFilter::for_owner(owner).pattern(pattern_id))
    }

    /// Existing occurrences are left as they are.
    pub fn update_pattern(
        &self,
        owner: &OwnerId,
        pattern_id: &str,
        patch: &PatternPatch,
    ) -> Result<RecurrencePattern> {
        self.stores
            .patterns
            .update(owner, pattern_id, patch)?
            .ok_or_else(|| BookingError::not_found("pattern", pattern_id))
    }

    /// Delete every occurrence of the pattern, then the pattern. The pattern
    /// row survives if any occurrence could not be deleted, so the call can
    /// be retried.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn delete_pattern(&self, owner: &OwnerId, pattern_id: &str) -> Result<usize> {
        let occurrences = self.list_pattern_occurrences(owner, pattern_id)?;
        let mut deleted = 0;
        let mut first_error = None;
        for occurrence in &occurrences {
            self.scheduler.cancel_logged(&occurrence.id);
            match self.stores.occurrences.delete(owner, &occurrence.id) {
                Ok(true) => deleted += 1,
                Ok(false) => {}
                Err(e) => {
                    warn!(occurrence_id = %occurrence.id, "cascade delete failed: {e}");
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }
        self.stores.patterns.delete(owner, pattern_id)?;
        info!(%pattern_id, deleted, "pattern deleted");
        Ok(deleted)
    }

    // ── Occurrences ─────────────────────────────────────────────────────────

    /// Create a standalone occurrence (or one linked to a quota).
    pub fn create_occurrence(&self, owner: &OwnerId, draft: &OccurrenceDraft) -> Result<Occurrence> {
        draft.validate()?;
        if let Some(quota_id) = &draft.quota_id {
            self.get_quota(owner, quota_id)?;
        }
        self.persist(owner, draft)
    }

    pub fn get_occurrence(&self, owner: &OwnerId, occurrence_id: &str) -> Result<Occurrence> {
        self.stores
            .occurrences
            .get(owner, occurrence_id)?
            .ok_or_else(|| BookingError::not_found("occurrence", occurrence_id))
    }

    pub fn list_occurrences(&self, filter: &OccurrenceFilter) -> Result<Vec<Occurrence>> {
        self.stores.occurrences.list(filter)
    }

    pub fn update_occurrence(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        patch: &OccurrencePatch,
    ) -> Result<Occurrence> {
        patch.validate()?;
        self.scoped.update_one(owner, occurrence_id, patch)
    }

    pub fn delete_occurrence(&self, owner: &OwnerId, occurrence_id: &str) -> Result<()> {
        self.scoped.delete_one(owner, occurrence_id)
    }

    pub fn update_scoped(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        patch: &OccurrencePatch,
        scope: Scope,
    ) -> Result<ScopeReport<Occurrence>> {
        self.scoped.update_scoped(owner, occurrence_id, patch, scope)
    }

    pub fn delete_scoped(
        &self,
        owner: &OwnerId,
        occurrence_id: &str,
        scope: Scope,
    ) -> Result<ScopeReport<String>> {
        self.scoped.delete_scoped(owner, occurrence_id, scope)
    }

    /// Write one draft, then activate its quota and arm its task. Neither
    /// follow-up rolls back the write.
    fn persist(&self, owner: &OwnerId, draft: &OccurrenceDraft) -> Result<Occurrence> {
        let occurrence = self.stores.occurrences.create(owner, draft)?;
        if let Some(quota_id) = &occurrence.quota_id {
            if let Err(e) =
                self.stores
                    .quotas
                    .set_activation_date_if_unset(owner, quota_id, occurrence.start)
            {
                warn!(%quota_id, "failed to activate quota: {e}");
            }
        }
        self.scheduler.reconcile_logged(&occurrence);
        debug!(occurrence_id = %occurrence.id, "occurrence persisted");
        Ok(occurrence)
    }

    // ── Status transitions ──────────────────────────────────────────────────

    pub fn on_occurrence_end(&self, owner: &OwnerId, occurrence_id: &str) -> Result<FireOutcome> {
        self.scheduler.on_fire(owner, occurrence_id, Utc::now())
    }

    pub fn handle_fired(&self, task: &Task) -> Result<FireOutcome> {
        self.scheduler.handle_fired(task)
    }

    pub fn recover_schedule(&self) -> Result<RecoverySummary> {
        self.scheduler.recover_on_startup(Utc::now())
    }

    // ── Quotas ──────────────────────────────────────────────────────────────

    pub fn create_quota(&self, owner: &OwnerId, request: &QuotaRequest) -> Result<Quota> {
        self.stores.quotas.create(owner, request)
    }

    pub fn get_quota(&self, owner: &OwnerId, quota_id: &str) -> Result<Quota> {
        self.stores
            .quotas
            .get(owner, quota_id)?
            .ok_or_else(|| BookingError::not_found("quota", quota_id))
    }

    pub fn quota_report(&self, owner: &OwnerId, quota_id: &str) -> Result<QuotaReport> {
        let quota = self.get_quota(owner, quota_id)?;
        let usage = self.allocator.usage(&quota)?;
        Ok(QuotaReport {
            quota_id: quota.id.clone(),
            total_credits: quota.total_credits,
            done: usage.done,
            scheduled: usage.scheduled,
            available: usage.available(quota.total_credits),
            price_per_credit: quota.price_per_credit,
            requested: 0,
            limited: false,
        })
    }

    pub fn cancel_quota(&self, owner: &OwnerId, quota_id: &str) -> Result<Quota> {
        let quota = self.get_quota(owner, quota_id)?;
        if !self
            .stores
            .quotas
            .set_status(owner, quota_id, QuotaStatus::Canceled)?
        {
            return Err(BookingError::invalid(format!(
                "quota {quota_id} is already {}",
                quota.status
            )));
        }
        self.get_quota(owner, quota_id)
    }

    pub fn sweep_expired_quotas(&self) -> Result<usize> {
        self.allocator.sweep_expired(Utc::now())
    }
}
