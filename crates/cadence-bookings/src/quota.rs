//! Quota-bounded series creation.
//!
//! Consumption is never stored: it is aggregated from linked occurrences on
//! every check (`done + upcoming`), so a status flip to `done` needs no extra
//! bookkeeping write.

use std::sync::Arc;

use cadence_core::OwnerId;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::{
    error::Result,
    store::{OccurrenceStore, QuotaStore},
    types::{Quota, QuotaStatus, QuotaUsage},
};

/// A usable quota and what is left of it.
#[derive(Debug, Clone, Serialize)]
pub struct QuotaGrant {
    pub quota: Quota,
    pub usage: QuotaUsage,
    /// Maximum number of new occurrences; always at least one.
    pub available: u32,
    /// Stamped onto every capped draft.
    pub override_rate: f64,
}

#[derive(Debug, Clone, Serialize)]
pub enum Allocation {
    Uncapped,
    Capped(QuotaGrant),
}

impl Allocation {
    pub fn cap(&self) -> Option<usize> {
        match self {
            Allocation::Uncapped => None,
            Allocation::Capped(grant) => Some(grant.available as usize),
        }
    }

    pub fn grant(&self) -> Option<&QuotaGrant> {
        match self {
            Allocation::Uncapped => None,
            Allocation::Capped(grant) => Some(grant),
        }
    }
}

pub struct QuotaAllocator {
    quotas: Arc<dyn QuotaStore>,
    occurrences: Arc<dyn OccurrenceStore>,
}

impl QuotaAllocator {
    pub fn new(quotas: Arc<dyn QuotaStore>, occurrences: Arc<dyn OccurrenceStore>) -> Self {
        Self {
            quotas,
            occurrences,
        }
    }

    pub fn usage(&self, quota: &Quota) -> Result<QuotaUsage> {
        self.occurrences.quota_usage(&quota.owner_id, &quota.id)
    }

    /// Cap for a new series for `client_id`.
    ///
    /// Without a usable ACTIVE quota the series is uncapped at the pattern's
    /// own rate. A quota found to be exhausted or past its window is expired
    /// on the spot and not used.
    #[instrument(skip(self), fields(owner = %owner))]
    pub fn allocate(
        &self,
        owner: &OwnerId,
        client_id: &str,
        wants_quota: bool,
        now: DateTime<Utc>,
    ) -> Result<Allocation> {
        if !wants_quota {
            return Ok(Allocation::Uncapped);
        }
        let Some(quota) = self.quotas.find_active(owner, client_id)? else {
            info!("no active quota, creating uncapped");
            return Ok(Allocation::Uncapped);
        };

        let usage = self.usage(&quota)?;
        if is_spent(&quota, usage, now) {
            self.quotas.set_status(owner, &quota.id, QuotaStatus::Expired)?;
            info!(quota_id = %quota.id, consumed = usage.consumed(), "quota spent, creating uncapped");
            return Ok(Allocation::Uncapped);
        }

        let available = usage.available(quota.total_credits);
        debug!(quota_id = %quota.id, available, "quota allocated");
        Ok(Allocation::Capped(QuotaGrant {
            override_rate: quota.price_per_credit,
            quota,
            usage,
            available,
        }))
    }

    /// Expire `quota_id` if it is exhausted or past its window. Returns
    /// whether this call expired it.
    pub fn refresh(&self, owner: &OwnerId, quota_id: &str, now: DateTime<Utc>) -> Result<bool> {
        let Some(quota) = self.quotas.get(owner, quota_id)? else {
            return Ok(false);
        };
        if quota.status != QuotaStatus::Active {
            return Ok(false);
        }
        let usage = self.usage(&quota)?;
        if is_spent(&quota, usage, now) {
            return self.quotas.set_status(owner, quota_id, QuotaStatus::Expired);
        }
        Ok(false)
    }

    /// Expire every ACTIVE quota that is spent. One failing quota is logged
    /// and skipped. Returns the number expired.
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut expired = 0;
        for quota in self.quotas.list_active()? {
            let usage = match self.usage(&quota) {
                Ok(usage) => usage,
                Err(e) => {
                    warn!(quota_id = %quota.id, "quota usage unavailable: {e}");
                    continue;
                }
            };
            if !is_spent(&quota, usage, now) {
                continue;
            }
            match self
                .quotas
                .set_status(&quota.owner_id, &quota.id, QuotaStatus::Expired)
            {
                Ok(true) => expired += 1,
                Ok(false) => {}
                Err(e) => warn!(quota_id = %quota.id, "failed to expire quota: {e}"),
            }
        }
        if expired > 0 {
            info!(count = expired, "quotas expired");
        }
        Ok(expired)
    }
}

fn is_spent(quota: &Quota, usage: QuotaUsage, now: DateTime<Utc>) -> bool {
    usage.consumed() >= quota.total_credits || quota.window_elapsed(now)
}
