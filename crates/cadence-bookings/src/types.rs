use cadence_core::OwnerId;
use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BookingError, Result};

/// How far apart consecutive occurrences of a pattern are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    /// Same day-of-month every month. Months without that day are skipped.
    Monthly,
}

impl std::fmt::Display for Frequency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Weekly => write!(f, "weekly"),
            Self::Biweekly => write!(f, "biweekly"),
            Self::Monthly => write!(f, "monthly"),
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = BookingError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "weekly" => Ok(Self::Weekly),
            "biweekly" => Ok(Self::Biweekly),
            "monthly" => Ok(Self::Monthly),
            other => Err(BookingError::invalid(format!("unknown frequency: {other}"))),
        }
    }
}

/// Which siblings a scoped edit or delete touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Exactly the target occurrence.
    ThisOnly,
    /// The target and every sibling starting at or after it.
    ThisAndFuture,
    /// Every occurrence of the pattern, past ones included.
    All,
}

impl std::fmt::Display for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ThisOnly => write!(f, "this_only"),
            Self::ThisAndFuture => write!(f, "this_and_future"),
            Self::All => write!(f, "all"),
        }
    }
}

impl std::str::FromStr for Scope {
    type Err = BookingError;
    fn from_str(s: &str) -> Result<Self> {
        // Older clients send `this_meeting_only` / `all_meetings`.
        match s.to_ascii_lowercase().as_str() {
            "this_only" | "this_meeting_only" => Ok(Self::ThisOnly),
            "this_and_future" => Ok(Self::ThisAndFuture),
            "all" | "all_meetings" => Ok(Self::All),
            other => Err(BookingError::invalid(format!("unknown scope: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MeetingStatus {
    Upcoming,
    Done,
    Canceled,
}

impl std::fmt::Display for MeetingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Upcoming => write!(f, "upcoming"),
            Self::Done => write!(f, "done"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for MeetingStatus {
    type Err = BookingError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "upcoming" => Ok(Self::Upcoming),
            "done" => Ok(Self::Done),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(BookingError::invalid(format!("unknown meeting status: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuotaStatus {
    Active,
    /// Terminal: all credits consumed or validity window elapsed.
    Expired,
    Canceled,
}

impl std::fmt::Display for QuotaStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "active"),
            Self::Expired => write!(f, "expired"),
            Self::Canceled => write!(f, "canceled"),
        }
    }
}

impl std::str::FromStr for QuotaStatus {
    type Err = BookingError;
    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "active" => Ok(Self::Active),
            "expired" => Ok(Self::Expired),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            other => Err(BookingError::invalid(format!("unknown quota status: {other}"))),
        }
    }
}

/// Parse a UTC wall-clock time in `HH:MM` form.
pub fn parse_time_of_day(s: &str) -> Result<NaiveTime> {
    NaiveTime::parse_from_str(s.trim(), "%H:%M")
        .map_err(|_| BookingError::invalid(format!("time of day must be HH:MM, got {s:?}")))
}

pub fn format_time_of_day(t: NaiveTime) -> String {
    t.format("%H:%M").to_string()
}

/// Duration in fractional hours times the hourly rate.
pub fn price_for(start: DateTime<Utc>, end: DateTime<Utc>, hourly_rate: f64) -> f64 {
    let hours = (end - start).num_seconds() as f64 / 3600.0;
    hours * hourly_rate
}

/// Distinguishes an explicit `null` from an absent field.
fn present<'de, D, T>(deserializer: D) -> std::result::Result<Option<T>, D::Error>
where
    D: serde::Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

pub(crate) fn validate_rate(rate: f64) -> Result<()> {
    if !rate.is_finite() || rate < 0.0 {
        return Err(BookingError::invalid(format!("hourly rate must be >= 0, got {rate}")));
    }
    Ok(())
}

pub(crate) fn validate_interval(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<()> {
    if end <= start {
        return Err(BookingError::invalid(format!(
            "end ({end}) must be after start ({start})"
        )));
    }
    Ok(())
}

/// Canonical daily slot of a pattern: start and end wall-clock time, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSlot {
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
}

impl TimeSlot {
    /// Build a slot; the end must be later than the start on the same day.
    pub fn new(start_time: NaiveTime, end_time: NaiveTime) -> Result<Self> {
        if end_time <= start_time {
            return Err(BookingError::invalid(format!(
                "end time {} must be later than start time {} on the same day",
                format_time_of_day(end_time),
                format_time_of_day(start_time)
            )));
        }
        Ok(Self {
            start_time,
            end_time,
        })
    }

    /// Project the slot onto a calendar date.
    pub fn on(&self, date: NaiveDate) -> (DateTime<Utc>, DateTime<Utc>) {
        (
            Utc.from_utc_datetime(&date.and_time(self.start_time)),
            Utc.from_utc_datetime(&date.and_time(self.end_time)),
        )
    }

    pub fn duration(&self) -> Duration {
        self.end_time - self.start_time
    }
}

/// A recurrence definition that occurrences are materialized from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurrencePattern {
    pub id: String,
    pub owner_id: OwnerId,
    /// The booked service / resource.
    pub resource_id: String,
    pub client_id: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    /// Inclusive. `None` means open-ended.
    pub end_date: Option<NaiveDate>,
    pub title: Option<String>,
    pub slot: TimeSlot,
    pub hourly_rate: f64,
    pub created_at: String,
    pub updated_at: String,
}

/// Input for creating a pattern.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatternRequest {
    pub resource_id: String,
    pub client_id: String,
    pub frequency: Frequency,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub title: Option<String>,
    pub start_time: NaiveTime,
    pub end_time: NaiveTime,
    pub hourly_rate: f64,
    /// Draw occurrences from the client's active quota, if one has credits.
    #[serde(default)]
    pub use_quota: bool,
}

impl PatternRequest {
    pub fn validate(&self) -> Result<TimeSlot> {
        validate_rate(self.hourly_rate)?;
        TimeSlot::new(self.start_time, self.end_time)
    }
}

/// Partial pattern update. Existing occurrences are never rewritten by it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PatternPatch {
    pub resource_id: Option<String>,
    pub client_id: Option<String>,
    pub frequency: Option<Frequency>,
    pub start_date: Option<NaiveDate>,
    /// `Some(None)` (JSON `null`) makes the series open-ended again.
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        deserialize_with = "present"
    )]
    pub end_date: Option<Option<NaiveDate>>,
    pub title: Option<String>,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
    pub hourly_rate: Option<f64>,
}

/// One concrete scheduled meeting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Occurrence {
    pub id: String,
    pub owner_id: OwnerId,
    /// `None` for standalone meetings.
    pub pattern_id: Option<String>,
    pub client_id: String,
    pub resource_id: String,
    pub quota_id: Option<String>,
    pub title: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hourly_rate: f64,
    /// Always `hours(end - start) * hourly_rate`.
    pub total_price: f64,
    pub status: MeetingStatus,
    pub paid: bool,
    pub created_at: String,
    pub updated_at: String,
}

/// A not-yet-persisted occurrence: materializer output and creation input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OccurrenceDraft {
    pub pattern_id: Option<String>,
    pub client_id: String,
    pub resource_id: String,
    pub quota_id: Option<String>,
    pub title: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub hourly_rate: f64,
    pub status: MeetingStatus,
    pub paid: bool,
}

impl OccurrenceDraft {
    pub fn validate(&self) -> Result<()> {
        validate_interval(self.start, self.end)?;
        validate_rate(self.hourly_rate)
    }

    pub fn total_price(&self) -> f64 {
        price_for(self.start, self.end, self.hourly_rate)
    }
}

/// Partial occurrence update; also the payload of a scoped edit.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OccurrencePatch {
    pub client_id: Option<String>,
    pub resource_id: Option<String>,
    pub title: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub hourly_rate: Option<f64>,
    pub status: Option<MeetingStatus>,
    pub paid: Option<bool>,
}

impl OccurrencePatch {
    pub fn touches_time(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Whether the scheduler task must be re-derived after applying this patch.
    pub fn touches_schedule(&self) -> bool {
        self.touches_time() || self.status.is_some()
    }

    /// Checks that need no stored state.
    pub fn validate(&self) -> Result<()> {
        if let Some(rate) = self.hourly_rate {
            validate_rate(rate)?;
        }
        if let (Some(start), Some(end)) = (self.start, self.end) {
            validate_interval(start, end)?;
        }
        Ok(())
    }

    /// Copy of this patch with only the non-time fields kept.
    pub(crate) fn without_times(&self) -> Self {
        Self {
            start: None,
            end: None,
            ..self.clone()
        }
    }
}

/// A prepaid bundle of occurrence credits for one client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Quota {
    pub id: String,
    pub owner_id: OwnerId,
    pub client_id: String,
    pub name: String,
    pub total_credits: u32,
    pub total_price: f64,
    pub price_per_credit: f64,
    pub validity_days: u32,
    /// Set when the first linked occurrence is created.
    pub activated_at: Option<DateTime<Utc>>,
    pub status: QuotaStatus,
    pub paid: bool,
    pub created_at: String,
    pub updated_at: String,
}

impl Quota {
    /// End of the validity window, once the quota has been activated.
    pub fn expires_at(&self) -> Option<DateTime<Utc>> {
        self.activated_at
            .map(|at| at + Duration::days(i64::from(self.validity_days)))
    }

    pub fn window_elapsed(&self, now: DateTime<Utc>) -> bool {
        self.expires_at().is_some_and(|end| now > end)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaRequest {
    pub client_id: String,
    pub name: String,
    pub total_credits: u32,
    pub total_price: f64,
    pub validity_days: u32,
}

impl QuotaRequest {
    pub fn validate(&self) -> Result<()> {
        if self.total_credits == 0 {
            return Err(BookingError::invalid("quota needs at least one credit"));
        }
        if self.validity_days == 0 {
            return Err(BookingError::invalid("quota validity must be at least one day"));
        }
        validate_rate(self.total_price)
    }

    pub fn price_per_credit(&self) -> f64 {
        self.total_price / f64::from(self.total_credits)
    }
}

/// Credits consumed by a quota, derived from linked occurrences on read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QuotaUsage {
    pub done: u32,
    pub scheduled: u32,
}

impl QuotaUsage {
    pub fn consumed(&self) -> u32 {
        self.done + self.scheduled
    }

    pub fn available(&self, total_credits: u32) -> u32 {
        total_credits.saturating_sub(self.consumed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(s: &str) -> NaiveTime {
        parse_time_of_day(s).unwrap()
    }

    #[test]
    fn scope_accepts_legacy_names_and_rejects_unknown() {
        assert_eq!("THIS_ONLY".parse::<Scope>().unwrap(), Scope::ThisOnly);
        assert_eq!("this_meeting_only".parse::<Scope>().unwrap(), Scope::ThisOnly);
        assert_eq!("all_meetings".parse::<Scope>().unwrap(), Scope::All);
        assert_eq!("This_And_Future".parse::<Scope>().unwrap(), Scope::ThisAndFuture);
        let err = "everything".parse::<Scope>().unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
    }

    #[test]
    fn frequency_is_a_closed_set() {
        assert_eq!("MONTHLY".parse::<Frequency>().unwrap(), Frequency::Monthly);
        assert!("daily".parse::<Frequency>().is_err());
    }

    #[test]
    fn time_of_day_parsing() {
        assert_eq!(format_time_of_day(t("09:05")), "09:05");
        assert!(parse_time_of_day("9am").is_err());
        assert!(parse_time_of_day("25:00").is_err());
    }

    #[test]
    fn slot_end_must_follow_start() {
        assert!(TimeSlot::new(t("15:00"), t("14:00")).is_err());
        assert!(TimeSlot::new(t("14:00"), t("14:00")).is_err());
        let slot = TimeSlot::new(t("14:00"), t("15:30")).unwrap();
        assert_eq!(slot.duration(), Duration::minutes(90));
    }

    #[test]
    fn slot_projects_onto_date() {
        let slot = TimeSlot::new(t("14:00"), t("15:00")).unwrap();
        let (start, end) = slot.on(NaiveDate::from_ymd_opt(2024, 3, 8).unwrap());
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 3, 8, 14, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2024, 3, 8, 15, 0, 0).unwrap());
    }

    #[test]
    fn price_is_hours_times_rate() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
        let end = Utc.with_ymd_and_hms(2024, 3, 1, 10, 30, 0).unwrap();
        assert!((price_for(start, end, 80.0) - 120.0).abs() < 1e-9);
    }

    #[test]
    fn patch_validation_catches_inverted_interval() {
        let start = Utc.with_ymd_and_hms(2024, 3, 1, 10, 0, 0).unwrap();
        let patch = OccurrencePatch {
            start: Some(start),
            end: Some(start - Duration::minutes(5)),
            ..Default::default()
        };
        assert!(patch.validate().is_err());
        let negative = OccurrencePatch {
            hourly_rate: Some(-1.0),
            ..Default::default()
        };
        assert!(negative.validate().is_err());
    }

    #[test]
    fn quota_usage_math() {
        let usage = QuotaUsage { done: 3, scheduled: 1 };
        assert_eq!(usage.consumed(), 4);
        assert_eq!(usage.available(5), 1);
        assert_eq!(usage.available(2), 0);
    }

    #[test]
    fn quota_window_only_runs_after_activation() {
        let mut quota = Quota {
            id: "q".into(),
            owner_id: OwnerId::from("o"),
            client_id: "c".into(),
            name: "10-pack".into(),
            total_credits: 10,
            total_price: 500.0,
            price_per_credit: 50.0,
            validity_days: 30,
            activated_at: None,
            status: QuotaStatus::Active,
            paid: false,
            created_at: String::new(),
            updated_at: String::new(),
        };
        let now = Utc::now();
        assert!(!quota.window_elapsed(now));
        quota.activated_at = Some(now - Duration::days(31));
        assert!(quota.window_elapsed(now));
    }

    #[test]
    fn pattern_patch_tells_null_end_date_from_absent() {
        let absent: PatternPatch = serde_json::from_str(r#"{"title":"Duet"}"#).unwrap();
        assert_eq!(absent.end_date, None);
        let cleared: PatternPatch = serde_json::from_str(r#"{"end_date":null}"#).unwrap();
        assert_eq!(cleared.end_date, Some(None));
        let set: PatternPatch = serde_json::from_str(r#"{"end_date":"2030-06-01"}"#).unwrap();
        assert_eq!(set.end_date, Some(NaiveDate::from_ymd_opt(2030, 6, 1)));
    }
}
