use std::sync::{Mutex, MutexGuard};

use cadence_core::{new_row_id, parse_db_timestamp, to_db_timestamp, OwnerId};
use chrono::Utc;
use rusqlite::{params_from_iter, types::Value, Connection, TransactionBehavior};
use tracing::{debug, instrument};

use super::{collect_rows, conversion_error, OccurrenceFilter, OccurrenceStore};
use crate::{
    db::init_db,
    error::{BookingError, Result},
    types::{price_for, validate_interval, Occurrence, OccurrenceDraft, OccurrencePatch, QuotaUsage},
};

const SELECT_OCCURRENCE: &str = "SELECT id, owner_id, pattern_id, client_id, resource_id, quota_id,
        title, start_at, end_at, hourly_rate, total_price, status, paid, created_at, updated_at
    FROM meetings";

pub struct SqliteOccurrenceStore {
    conn: Mutex<Connection>,
}

impl SqliteOccurrenceStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BookingError::TransientStore("occurrence store lock poisoned".to_string()))
    }
}

impl OccurrenceStore for SqliteOccurrenceStore {
    fn list(&self, filter: &OccurrenceFilter) -> Result<Vec<Occurrence>> {
        let (clause, params) = where_clause(filter);
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_OCCURRENCE}{clause} ORDER BY start_at, id"
        ))?;
        let rows = stmt.query_map(params_from_iter(params), row_to_occurrence)?;
        let occurrences = collect_rows("occurrence", rows);
        Ok(occurrences)
    }

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<Occurrence>> {
        let conn = self.lock()?;
        get_occurrence(&conn, owner, id)
    }

    #[instrument(skip(self, draft), fields(owner = %owner, start = %draft.start))]
    fn create(&self, owner: &OwnerId, draft: &OccurrenceDraft) -> Result<Occurrence> {
        draft.validate()?;
        let now = to_db_timestamp(Utc::now());
        let occurrence = Occurrence {
            id: new_row_id(),
            owner_id: owner.clone(),
            pattern_id: draft.pattern_id.clone(),
            client_id: draft.client_id.clone(),
            resource_id: draft.resource_id.clone(),
            quota_id: draft.quota_id.clone(),
            title: draft.title.clone(),
            start: draft.start,
            end: draft.end,
            hourly_rate: draft.hourly_rate,
            total_price: draft.total_price(),
            status: draft.status,
            paid: draft.paid,
            created_at: now.clone(),
            updated_at: now,
        };

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO meetings (id, owner_id, pattern_id, client_id, resource_id, quota_id,
                title, start_at, end_at, hourly_rate, total_price, status, paid,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            rusqlite::params![
                occurrence.id,
                occurrence.owner_id.as_str(),
                occurrence.pattern_id,
                occurrence.client_id,
                occurrence.resource_id,
                occurrence.quota_id,
                occurrence.title,
                to_db_timestamp(occurrence.start),
                to_db_timestamp(occurrence.end),
                occurrence.hourly_rate,
                occurrence.total_price,
                occurrence.status.to_string(),
                occurrence.paid,
                occurrence.created_at,
                occurrence.updated_at,
            ],
        )?;
        debug!(occurrence_id = %occurrence.id, "occurrence created");
        Ok(occurrence)
    }

    #[instrument(skip(self, patch), fields(owner = %owner, occurrence_id = %id))]
    fn update(
        &self,
        owner: &OwnerId,
        id: &str,
        patch: &OccurrencePatch,
    ) -> Result<Option<Occurrence>> {
        patch.validate()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let Some(mut occurrence) = get_occurrence(&tx, owner, id)? else {
            return Ok(None);
        };
        apply_patch(&mut occurrence, patch);
        validate_interval(occurrence.start, occurrence.end)?;
        occurrence.total_price = price_for(occurrence.start, occurrence.end, occurrence.hourly_rate);
        occurrence.updated_at = to_db_timestamp(Utc::now());

        tx.execute(
            "UPDATE meetings SET client_id = ?1, resource_id = ?2, title = ?3,
                start_at = ?4, end_at = ?5, hourly_rate = ?6, total_price = ?7,
                status = ?8, paid = ?9, updated_at = ?10
             WHERE id = ?11 AND owner_id = ?12",
            rusqlite::params![
                occurrence.client_id,
                occurrence.resource_id,
                occurrence.title,
                to_db_timestamp(occurrence.start),
                to_db_timestamp(occurrence.end),
                occurrence.hourly_rate,
                occurrence.total_price,
                occurrence.status.to_string(),
                occurrence.paid,
                occurrence.updated_at,
                id,
                owner.as_str(),
            ],
        )?;
        tx.commit()?;
        debug!("occurrence updated");
        Ok(Some(occurrence))
    }

    fn delete(&self, owner: &OwnerId, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM meetings WHERE id = ?1 AND owner_id = ?2",
            rusqlite::params![id, owner.as_str()],
        )?;
        Ok(n > 0)
    }

    fn complete_if_upcoming(&self, owner: &OwnerId, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE meetings SET status = 'done', updated_at = ?1
             WHERE id = ?2 AND owner_id = ?3 AND status = 'upcoming'",
            rusqlite::params![to_db_timestamp(Utc::now()), id, owner.as_str()],
        )?;
        Ok(n > 0)
    }

    fn quota_usage(&self, owner: &OwnerId, quota_id: &str) -> Result<QuotaUsage> {
        let conn = self.lock()?;
        let usage = conn.query_row(
            "SELECT COALESCE(SUM(status = 'done'), 0), COALESCE(SUM(status = 'upcoming'), 0)
             FROM meetings WHERE owner_id = ?1 AND quota_id = ?2",
            rusqlite::params![owner.as_str(), quota_id],
            |row| {
                Ok(QuotaUsage {
                    done: row.get(0)?,
                    scheduled: row.get(1)?,
                })
            },
        )?;
        Ok(usage)
    }
}

fn apply_patch(occurrence: &mut Occurrence, patch: &OccurrencePatch) {
    if let Some(client_id) = &patch.client_id {
        occurrence.client_id = client_id.clone();
    }
    if let Some(resource_id) = &patch.resource_id {
        occurrence.resource_id = resource_id.clone();
    }
    if let Some(title) = &patch.title {
        occurrence.title = Some(title.clone());
    }
    if let Some(start) = patch.start {
        occurrence.start = start;
    }
    if let Some(end) = patch.end {
        occurrence.end = end;
    }
    if let Some(rate) = patch.hourly_rate {
        occurrence.hourly_rate = rate;
    }
    if let Some(status) = patch.status {
        occurrence.status = status;
    }
    if let Some(paid) = patch.paid {
        occurrence.paid = paid;
    }
}

/// Render `filter` as a WHERE clause with positional parameters.
fn where_clause(filter: &OccurrenceFilter) -> (String, Vec<Value>) {
    let mut conds: Vec<String> = Vec::new();
    let mut params: Vec<Value> = Vec::new();

    if let Some(owner) = &filter.owner {
        conds.push("owner_id = ?".into());
        params.push(Value::Text(owner.as_str().to_string()));
    }
    if let Some(pattern_id) = &filter.pattern_id {
        conds.push("pattern_id = ?".into());
        params.push(Value::Text(pattern_id.clone()));
    }
    if let Some(quota_id) = &filter.quota_id {
        conds.push("quota_id = ?".into());
        params.push(Value::Text(quota_id.clone()));
    }
    if !filter.statuses.is_empty() {
        let marks = vec!["?"; filter.statuses.len()].join(", ");
        conds.push(format!("status IN ({marks})"));
        params.extend(filter.statuses.iter().map(|s| Value::Text(s.to_string())));
    }
    if let Some(at) = filter.start_from {
        conds.push("start_at >= ?".into());
        params.push(Value::Text(to_db_timestamp(at)));
    }
    if let Some(at) = filter.start_until {
        conds.push("start_at <= ?".into());
        params.push(Value::Text(to_db_timestamp(at)));
    }
    if let Some(at) = filter.end_after {
        conds.push("end_at > ?".into());
        params.push(Value::Text(to_db_timestamp(at)));
    }

    if conds.is_empty() {
        (String::new(), params)
    } else {
        (format!(" WHERE {}", conds.join(" AND ")), params)
    }
}

fn get_occurrence(conn: &Connection, owner: &OwnerId, id: &str) -> Result<Option<Occurrence>> {
    match conn.query_row(
        &format!("{SELECT_OCCURRENCE} WHERE id = ?1 AND owner_id = ?2"),
        rusqlite::params![id, owner.as_str()],
        row_to_occurrence,
    ) {
        Ok(occurrence) => Ok(Some(occurrence)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn row_to_occurrence(row: &rusqlite::Row<'_>) -> rusqlite::Result<Occurrence> {
    let owner_id: String = row.get(1)?;
    let start: String = row.get(7)?;
    let end: String = row.get(8)?;
    let status: String = row.get(11)?;
    Ok(Occurrence {
        id: row.get(0)?,
        owner_id: OwnerId(owner_id),
        pattern_id: row.get(2)?,
        client_id: row.get(3)?,
        resource_id: row.get(4)?,
        quota_id: row.get(5)?,
        title: row.get(6)?,
        start: parse_db_timestamp(&start).map_err(|e| conversion_error(7, e))?,
        end: parse_db_timestamp(&end).map_err(|e| conversion_error(8, e))?,
        hourly_rate: row.get(9)?,
        total_price: row.get(10)?,
        status: status.parse().map_err(|e: BookingError| conversion_error(11, e))?,
        paid: row.get(12)?,
        created_at: row.get(13)?,
        updated_at: row.get(14)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MeetingStatus;
    use chrono::{DateTime, Duration, TimeZone};

    fn store() -> SqliteOccurrenceStore {
        SqliteOccurrenceStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, day, hour, 0, 0).unwrap()
    }

    fn draft(day: u32) -> OccurrenceDraft {
        OccurrenceDraft {
            pattern_id: Some("pat-1".into()),
            client_id: "client".into(),
            resource_id: "piano".into(),
            quota_id: None,
            title: Some("Lesson".into()),
            start: at(day, 14),
            end: at(day, 15),
            hourly_rate: 60.0,
            status: MeetingStatus::Upcoming,
            paid: false,
        }
    }

    #[test]
    fn rows_are_invisible_to_other_owners() {
        let store = store();
        let alice = OwnerId::from("alice");
        let bob = OwnerId::from("bob");
        let occ = store.create(&alice, &draft(1)).unwrap();

        assert!(store.get(&alice, &occ.id).unwrap().is_some());
        assert!(store.get(&bob, &occ.id).unwrap().is_none());
        assert!(store.update(&bob, &occ.id, &OccurrencePatch::default()).unwrap().is_none());
        assert!(!store.delete(&bob, &occ.id).unwrap());
        assert!(store.list(&OccurrenceFilter::for_owner(&bob)).unwrap().is_empty());
    }

    #[test]
    fn list_filters_and_orders_by_start() {
        let store = store();
        let owner = OwnerId::from("o");
        for day in [15, 1, 8] {
            store.create(&owner, &draft(day)).unwrap();
        }
        let mut other = draft(22);
        other.pattern_id = Some("pat-2".into());
        store.create(&owner, &other).unwrap();

        let all = store
            .list(&OccurrenceFilter::for_owner(&owner).pattern("pat-1"))
            .unwrap();
        let starts: Vec<_> = all.iter().map(|o| o.start).collect();
        assert_eq!(starts, vec![at(1, 14), at(8, 14), at(15, 14)]);

        let later = store
            .list(
                &OccurrenceFilter::for_owner(&owner)
                    .pattern("pat-1")
                    .starting_from(at(8, 14)),
            )
            .unwrap();
        assert_eq!(later.len(), 2);

        let window = store
            .list(
                &OccurrenceFilter::for_owner(&owner)
                    .starting_from(at(2, 0))
                    .starting_until(at(20, 0)),
            )
            .unwrap();
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn list_filters_by_quota_status_and_end() {
        let store = store();
        let owner = OwnerId::from("o");
        for (day, quota, status) in [
            (1, Some("q"), MeetingStatus::Done),
            (8, Some("q"), MeetingStatus::Upcoming),
            (15, None, MeetingStatus::Upcoming),
            (22, Some("q"), MeetingStatus::Canceled),
        ] {
            let mut d = draft(day);
            d.quota_id = quota.map(String::from);
            d.status = status;
            store.create(&owner, &d).unwrap();
        }

        let linked = store
            .list(&OccurrenceFilter::for_owner(&owner).quota("q"))
            .unwrap();
        assert_eq!(linked.len(), 3);

        let live = store
            .list(
                &OccurrenceFilter::for_owner(&owner)
                    .quota("q")
                    .status_in([MeetingStatus::Done, MeetingStatus::Upcoming]),
            )
            .unwrap();
        let days: Vec<_> = live.iter().map(|o| o.start).collect();
        assert_eq!(days, vec![at(1, 14), at(8, 14)]);

        // Ends at exactly 15:00 on the 8th, so only strictly later ends match.
        let after = store
            .list(&OccurrenceFilter::for_owner(&owner).ending_after(at(8, 15)))
            .unwrap();
        assert_eq!(after.len(), 2);
    }

    #[test]
    fn update_recomputes_price_and_rejects_inverted_interval() {
        let store = store();
        let owner = OwnerId::from("o");
        let occ = store.create(&owner, &draft(1)).unwrap();
        assert!((occ.total_price - 60.0).abs() < 1e-9);

        let longer = OccurrencePatch {
            end: Some(occ.end + Duration::minutes(30)),
            ..Default::default()
        };
        let updated = store.update(&owner, &occ.id, &longer).unwrap().unwrap();
        assert!((updated.total_price - 90.0).abs() < 1e-9);

        let inverted = OccurrencePatch {
            start: Some(occ.end + Duration::hours(2)),
            ..Default::default()
        };
        let err = store.update(&owner, &occ.id, &inverted).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        let unchanged = store.get(&owner, &occ.id).unwrap().unwrap();
        assert_eq!(unchanged.start, occ.start);
    }

    #[test]
    fn complete_if_upcoming_is_conditional() {
        let store = store();
        let owner = OwnerId::from("o");
        let occ = store.create(&owner, &draft(1)).unwrap();

        assert!(store.complete_if_upcoming(&owner, &occ.id).unwrap());
        assert!(!store.complete_if_upcoming(&owner, &occ.id).unwrap());
        let done = store.get(&owner, &occ.id).unwrap().unwrap();
        assert_eq!(done.status, MeetingStatus::Done);
    }

    #[test]
    fn quota_usage_counts_done_and_upcoming() {
        let store = store();
        let owner = OwnerId::from("o");
        assert_eq!(store.quota_usage(&owner, "q").unwrap(), QuotaUsage::default());

        for day in [1, 8, 15, 22, 29] {
            let mut d = draft(day);
            d.quota_id = Some("q".into());
            d.status = match day {
                1 | 8 | 15 => MeetingStatus::Done,
                22 => MeetingStatus::Upcoming,
                _ => MeetingStatus::Canceled,
            };
            store.create(&owner, &d).unwrap();
        }
        let usage = store.quota_usage(&owner, "q").unwrap();
        assert_eq!(usage, QuotaUsage { done: 3, scheduled: 1 });
    }
}
