//! Pure expansion of a [`RecurrencePattern`] into occurrence drafts.

use chrono::{Datelike, Duration, NaiveDate};

use crate::types::{Frequency, MeetingStatus, OccurrenceDraft, RecurrencePattern};

/// Inclusive calendar range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// The pattern's own range. Open-ended patterns stop `horizon_days`
    /// after their start date.
    pub fn for_pattern(pattern: &RecurrencePattern, horizon_days: u32) -> Self {
        let end = pattern
            .end_date
            .unwrap_or(pattern.start_date + Duration::days(i64::from(horizon_days)));
        Self::new(pattern.start_date, end)
    }
}

/// Build one `upcoming`, unpaid draft per matching date in `range`,
/// ascending. Empty when `range.start > range.end`.
///
/// Monthly series reuse the start date's day-of-month and skip months that
/// do not have it (a series on the 31st has no April occurrence).
pub fn materialize(pattern: &RecurrencePattern, range: DateRange) -> Vec<OccurrenceDraft> {
    dates(pattern.frequency, range)
        .into_iter()
        .map(|date| {
            let (start, end) = pattern.slot.on(date);
            OccurrenceDraft {
                pattern_id: Some(pattern.id.clone()),
                client_id: pattern.client_id.clone(),
                resource_id: pattern.resource_id.clone(),
                quota_id: None,
                title: pattern.title.clone(),
                start,
                end,
                hourly_rate: pattern.hourly_rate,
                status: MeetingStatus::Upcoming,
                paid: false,
            }
        })
        .collect()
}

fn dates(frequency: Frequency, range: DateRange) -> Vec<NaiveDate> {
    let mut out = Vec::new();
    match frequency {
        Frequency::Weekly | Frequency::Biweekly => {
            let step = Duration::days(if frequency == Frequency::Weekly { 7 } else { 14 });
            let mut date = range.start;
            while date <= range.end {
                out.push(date);
                date += step;
            }
        }
        Frequency::Monthly => {
            let day = range.start.day();
            let mut year = range.start.year();
            let mut month = range.start.month();
            loop {
                let Some(first) = NaiveDate::from_ymd_opt(year, month, 1) else {
                    break;
                };
                if first > range.end {
                    break;
                }
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, day) {
                    if date > range.end {
                        break;
                    }
                    out.push(date);
                }
                if month == 12 {
                    month = 1;
                    year += 1;
                } else {
                    month += 1;
                }
            }
        }
    }
    out
}
