//! Persistence seams for patterns, occurrences and quotas.
//!
//! Each trait has one SQLite implementation holding its own
//! `Mutex<Connection>`. Every query is scoped by [`OwnerId`]; a row that
//! exists under another owner is reported exactly like a missing row.

mod occurrence;
mod pattern;
mod quota;

use std::error::Error as StdError;
use std::path::Path;
use std::sync::Arc;

use cadence_core::OwnerId;
use chrono::{DateTime, Utc};
use rusqlite::{types::Type, Connection};
use tracing::warn;

use crate::error::Result;
use crate::types::{
    MeetingStatus, Occurrence, OccurrenceDraft, OccurrencePatch, PatternPatch, PatternRequest,
    Quota, QuotaRequest, QuotaStatus, QuotaUsage, RecurrencePattern, TimeSlot,
};

pub use occurrence::SqliteOccurrenceStore;
pub use pattern::SqlitePatternStore;
pub use quota::SqliteQuotaStore;

pub trait PatternStore: Send + Sync {
    fn create(
        &self,
        owner: &OwnerId,
        request: &PatternRequest,
        slot: TimeSlot,
    ) -> Result<RecurrencePattern>;

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<RecurrencePattern>>;

    fn list(&self, owner: &OwnerId) -> Result<Vec<RecurrencePattern>>;

    /// Apply `patch` atomically. `None` when the pattern is absent.
    fn update(
        &self,
        owner: &OwnerId,
        id: &str,
        patch: &PatternPatch,
    ) -> Result<Option<RecurrencePattern>>;

    fn delete(&self, owner: &OwnerId, id: &str) -> Result<bool>;
}

pub trait OccurrenceStore: Send + Sync {
    /// Rows matching `filter`, ascending by start instant.
    fn list(&self, filter: &OccurrenceFilter) -> Result<Vec<Occurrence>>;

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<Occurrence>>;

    fn create(&self, owner: &OwnerId, draft: &OccurrenceDraft) -> Result<Occurrence>;

    /// Re-read, patch and write one row inside a single write transaction.
    /// The total price is recomputed from the resulting interval and rate.
    fn update(
        &self,
        owner: &OwnerId,
        id: &str,
        patch: &OccurrencePatch,
    ) -> Result<Option<Occurrence>>;

    fn delete(&self, owner: &OwnerId, id: &str) -> Result<bool>;

    /// Conditional `upcoming → done`. Returns `false` if the row is gone or
    /// has already left `upcoming`.
    fn complete_if_upcoming(&self, owner: &OwnerId, id: &str) -> Result<bool>;

    /// Done and still-upcoming occurrences linked to `quota_id`.
    fn quota_usage(&self, owner: &OwnerId, quota_id: &str) -> Result<QuotaUsage>;
}

pub trait QuotaStore: Send + Sync {
    /// Insert a new ACTIVE quota. Fails with `InvalidArgument` when the
    /// (owner, client) pair already has one.
    fn create(&self, owner: &OwnerId, request: &QuotaRequest) -> Result<Quota>;

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<Quota>>;

    fn find_active(&self, owner: &OwnerId, client_id: &str) -> Result<Option<Quota>>;

    /// ACTIVE quotas of every owner, for the expiry sweep.
    fn list_active(&self) -> Result<Vec<Quota>>;

    fn set_activation_date_if_unset(
        &self,
        owner: &OwnerId,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// Move an ACTIVE quota to `status`. Terminal quotas are left untouched
    /// and `false` is returned.
    fn set_status(&self, owner: &OwnerId, id: &str, status: QuotaStatus) -> Result<bool>;
}

/// Equality, range and set-membership filter over occurrences.
#[derive(Debug, Clone, Default)]
pub struct OccurrenceFilter {
    owner: Option<OwnerId>,
    pattern_id: Option<String>,
    quota_id: Option<String>,
    statuses: Vec<MeetingStatus>,
    start_from: Option<DateTime<Utc>>,
    start_until: Option<DateTime<Utc>>,
    end_after: Option<DateTime<Utc>>,
}

impl OccurrenceFilter {
    pub fn for_owner(owner: &OwnerId) -> Self {
        Self {
            owner: Some(owner.clone()),
            ..Default::default()
        }
    }

    /// Unscoped filter. Only startup recovery should use this.
    pub fn any_owner() -> Self {
        Self::default()
    }

    pub fn pattern(mut self, pattern_id: impl Into<String>) -> Self {
        self.pattern_id = Some(pattern_id.into());
        self
    }

    pub fn quota(mut self, quota_id: impl Into<String>) -> Self {
        self.quota_id = Some(quota_id.into());
        self
    }

    pub fn status_in(mut self, statuses: impl IntoIterator<Item = MeetingStatus>) -> Self {
        self.statuses = statuses.into_iter().collect();
        self
    }

    /// `start >= at`
    pub fn starting_from(mut self, at: DateTime<Utc>) -> Self {
        self.start_from = Some(at);
        self
    }

    /// `start <= at`
    pub fn starting_until(mut self, at: DateTime<Utc>) -> Self {
        self.start_until = Some(at);
        self
    }

    /// `end > at`
    pub fn ending_after(mut self, at: DateTime<Utc>) -> Self {
        self.end_after = Some(at);
        self
    }
}

/// The three stores, shared behind trait objects.
#[derive(Clone)]
pub struct Stores {
    pub patterns: Arc<dyn PatternStore>,
    pub occurrences: Arc<dyn OccurrenceStore>,
    pub quotas: Arc<dyn QuotaStore>,
}

impl Stores {
    /// Open all three SQLite stores on `path`, one connection each.
    pub fn open(path: &Path) -> Result<Self> {
        Ok(Self {
            patterns: Arc::new(SqlitePatternStore::new(crate::db::open_connection(path)?)?),
            occurrences: Arc::new(SqliteOccurrenceStore::new(crate::db::open_connection(path)?)?),
            quotas: Arc::new(SqliteQuotaStore::new(crate::db::open_connection(path)?)?),
        })
    }

    /// Independent in-memory stores. Each table lives in its own database,
    /// which is enough since no query crosses tables.
    pub fn in_memory() -> Result<Self> {
        Ok(Self {
            patterns: Arc::new(SqlitePatternStore::new(Connection::open_in_memory()?)?),
            occurrences: Arc::new(SqliteOccurrenceStore::new(Connection::open_in_memory()?)?),
            quotas: Arc::new(SqliteQuotaStore::new(Connection::open_in_memory()?)?),
        })
    }
}

pub(crate) fn conversion_error(
    idx: usize,
    e: impl Into<Box<dyn StdError + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, e.into())
}

/// Keep decodable rows; a corrupt row is logged and skipped.
pub(crate) fn collect_rows<T>(
    kind: &str,
    rows: impl Iterator<Item = rusqlite::Result<T>>,
) -> Vec<T> {
    rows.filter_map(|r| match r {
        Ok(row) => Some(row),
        Err(e) => {
            warn!("skipping undecodable {kind} row: {e}");
            None
        }
    })
    .collect()
}
