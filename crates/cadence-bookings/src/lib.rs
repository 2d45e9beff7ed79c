//! `cadence-bookings`: recurring booking engine.
//!
//! A [`RecurrencePattern`] ("every Monday 14:00–15:00 for a client") is
//! expanded by the [`materialize`] module into independent [`Occurrence`]
//! rows. The [`scoped`] engine applies edits and deletions to one occurrence,
//! to it and every later sibling, or to the whole series. The [`status`]
//! scheduler arms one durable task per upcoming occurrence so it flips to
//! `done` at its end time, and reconciles those tasks after a restart. The
//! [`quota`] allocator caps series creation by a prepaid credit bundle.
//!
//! [`BookingService`] wires all of this together over the [`store`] traits.

pub mod db;
pub mod error;
pub mod materialize;
pub mod quota;
pub mod scoped;
pub mod service;
pub mod status;
pub mod store;
pub mod types;

pub use error::{BookingError, Result};
pub use materialize::{materialize, DateRange};
pub use quota::{Allocation, QuotaAllocator, QuotaGrant};
pub use scoped::{ScopeReport, ScopedMutationEngine, SiblingFailure};
pub use service::{BookingService, QuotaReport, RecurrenceCreated};
pub use status::{FireOutcome, RecoverySummary, StatusScheduler};
pub use store::{
    OccurrenceFilter, OccurrenceStore, PatternStore, QuotaStore, SqliteOccurrenceStore,
    SqlitePatternStore, SqliteQuotaStore, Stores,
};
pub use types::{
    Frequency, MeetingStatus, Occurrence, OccurrenceDraft, OccurrencePatch, PatternPatch,
    PatternRequest, Quota, QuotaRequest, QuotaStatus, QuotaUsage, RecurrencePattern, Scope,
    TimeSlot,
};
