use std::sync::{Mutex, MutexGuard};

use cadence_core::{new_row_id, to_db_timestamp, OwnerId};
use chrono::{NaiveDate, Utc};
use rusqlite::{Connection, TransactionBehavior};
use tracing::{debug, instrument};

use super::{collect_rows, conversion_error, PatternStore};
use crate::{
    db::init_db,
    error::{BookingError, Result},
    types::{
        format_time_of_day, parse_time_of_day, validate_rate, PatternPatch, PatternRequest,
        RecurrencePattern, TimeSlot,
    },
};

const SELECT_PATTERN: &str = "SELECT id, owner_id, resource_id, client_id, frequency,
        start_date, end_date, title, start_time, end_time, hourly_rate, created_at, updated_at
    FROM patterns";

const DATE_FORMAT: &str = "%Y-%m-%d";

pub struct SqlitePatternStore {
    conn: Mutex<Connection>,
}

impl SqlitePatternStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BookingError::TransientStore("pattern store lock poisoned".to_string()))
    }
}

impl PatternStore for SqlitePatternStore {
    #[instrument(skip(self, request, slot), fields(owner = %owner, client = %request.client_id))]
    fn create(
        &self,
        owner: &OwnerId,
        request: &PatternRequest,
        slot: TimeSlot,
    ) -> Result<RecurrencePattern> {
        let now = to_db_timestamp(Utc::now());
        let pattern = RecurrencePattern {
            id: new_row_id(),
            owner_id: owner.clone(),
            resource_id: request.resource_id.clone(),
            client_id: request.client_id.clone(),
            frequency: request.frequency,
            start_date: request.start_date,
            end_date: request.end_date,
            title: request.title.clone(),
            slot,
            hourly_rate: request.hourly_rate,
            created_at: now.clone(),
            updated_at: now,
        };
        let conn = self.lock()?;
        write_pattern(&conn, &pattern, true)?;
        debug!(pattern_id = %pattern.id, "pattern created");
        Ok(pattern)
    }

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<RecurrencePattern>> {
        let conn = self.lock()?;
        get_pattern(&conn, owner, id)
    }

    fn list(&self, owner: &OwnerId) -> Result<Vec<RecurrencePattern>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_PATTERN} WHERE owner_id = ?1 ORDER BY created_at, id"
        ))?;
        let rows = stmt.query_map([owner.as_str()], row_to_pattern)?;
        let patterns = collect_rows("pattern", rows);
        Ok(patterns)
    }

    #[instrument(skip(self, patch), fields(owner = %owner, pattern_id = %id))]
    fn update(
        &self,
        owner: &OwnerId,
        id: &str,
        patch: &PatternPatch,
    ) -> Result<Option<RecurrencePattern>> {
        if let Some(rate) = patch.hourly_rate {
            validate_rate(rate)?;
        }
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let Some(mut pattern) = get_pattern(&tx, owner, id)? else {
            return Ok(None);
        };

        if let Some(v) = &patch.resource_id {
            pattern.resource_id = v.clone();
        }
        if let Some(v) = &patch.client_id {
            pattern.client_id = v.clone();
        }
        if let Some(v) = patch.frequency {
            pattern.frequency = v;
        }
        if let Some(v) = patch.start_date {
            pattern.start_date = v;
        }
        if let Some(v) = patch.end_date {
            pattern.end_date = v;
        }
        if let Some(v) = &patch.title {
            pattern.title = Some(v.clone());
        }
        if let Some(v) = patch.hourly_rate {
            pattern.hourly_rate = v;
        }
        pattern.slot = TimeSlot::new(
            patch.start_time.unwrap_or(pattern.slot.start_time),
            patch.end_time.unwrap_or(pattern.slot.end_time),
        )?;
        pattern.updated_at = to_db_timestamp(Utc::now());

        write_pattern(&tx, &pattern, false)?;
        tx.commit()?;
        debug!("pattern updated");
        Ok(Some(pattern))
    }

    fn delete(&self, owner: &OwnerId, id: &str) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "DELETE FROM patterns WHERE id = ?1 AND owner_id = ?2",
            rusqlite::params![id, owner.as_str()],
        )?;
        Ok(n > 0)
    }
}

fn write_pattern(conn: &Connection, p: &RecurrencePattern, insert: bool) -> Result<()> {
    let sql = if insert {
        "INSERT INTO patterns (resource_id, client_id, frequency, start_date, end_date, title,
            start_time, end_time, hourly_rate, updated_at, id, owner_id, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
    } else {
        "UPDATE patterns SET resource_id = ?1, client_id = ?2, frequency = ?3,
            start_date = ?4, end_date = ?5, title = ?6, start_time = ?7, end_time = ?8,
            hourly_rate = ?9, updated_at = ?10
         WHERE id = ?11 AND owner_id = ?12 AND created_at = ?13"
    };
    conn.execute(
        sql,
        rusqlite::params![
            p.resource_id,
            p.client_id,
            p.frequency.to_string(),
            p.start_date.format(DATE_FORMAT).to_string(),
            p.end_date.map(|d| d.format(DATE_FORMAT).to_string()),
            p.title,
            format_time_of_day(p.slot.start_time),
            format_time_of_day(p.slot.end_time),
            p.hourly_rate,
            p.updated_at,
            p.id,
            p.owner_id.as_str(),
            p.created_at,
        ],
    )?;
    Ok(())
}

fn get_pattern(conn: &Connection, owner: &OwnerId, id: &str) -> Result<Option<RecurrencePattern>> {
    match conn.query_row(
        &format!("{SELECT_PATTERN} WHERE id = ?1 AND owner_id = ?2"),
        rusqlite::params![id, owner.as_str()],
        row_to_pattern,
    ) {
        Ok(pattern) => Ok(Some(pattern)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn parse_date(idx: usize, s: &str) -> rusqlite::Result<NaiveDate> {
    NaiveDate::parse_from_str(s, DATE_FORMAT).map_err(|e| conversion_error(idx, e))
}

fn row_to_pattern(row: &rusqlite::Row<'_>) -> rusqlite::Result<RecurrencePattern> {
    let owner_id: String = row.get(1)?;
    let frequency: String = row.get(4)?;
    let start_date: String = row.get(5)?;
    let end_date: Option<String> = row.get(6)?;
    let start_time: String = row.get(8)?;
    let end_time: String = row.get(9)?;

    let start_time = parse_time_of_day(&start_time).map_err(|e| conversion_error(8, e))?;
    let end_time = parse_time_of_day(&end_time).map_err(|e| conversion_error(9, e))?;

    Ok(RecurrencePattern {
        id: row.get(0)?,
        owner_id: OwnerId(owner_id),
        resource_id: row.get(2)?,
        client_id: row.get(3)?,
        frequency: frequency
            .parse()
            .map_err(|e: BookingError| conversion_error(4, e))?,
        start_date: parse_date(5, &start_date)?,
        end_date: end_date.as_deref().map(|d| parse_date(6, d)).transpose()?,
        title: row.get(7)?,
        slot: TimeSlot::new(start_time, end_time).map_err(|e| conversion_error(9, e))?,
        hourly_rate: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Frequency;

    fn store() -> SqlitePatternStore {
        SqlitePatternStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn request() -> PatternRequest {
        PatternRequest {
            resource_id: "piano".into(),
            client_id: "client".into(),
            frequency: Frequency::Weekly,
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
            end_date: None,
            title: Some("Lesson".into()),
            start_time: parse_time_of_day("14:00").unwrap(),
            end_time: parse_time_of_day("15:00").unwrap(),
            hourly_rate: 60.0,
            use_quota: false,
        }
    }

    #[test]
    fn create_and_read_back() {
        let store = store();
        let owner = OwnerId::from("o");
        let req = request();
        let created = store.create(&owner, &req, req.validate().unwrap()).unwrap();

        let read = store.get(&owner, &created.id).unwrap().unwrap();
        assert_eq!(read.frequency, Frequency::Weekly);
        assert_eq!(read.end_date, None);
        assert_eq!(format_time_of_day(read.slot.start_time), "14:00");
        assert!(store.get(&OwnerId::from("other"), &created.id).unwrap().is_none());
        assert_eq!(store.list(&owner).unwrap().len(), 1);
    }

    #[test]
    fn update_keeps_time_of_day_invariant() {
        let store = store();
        let owner = OwnerId::from("o");
        let req = request();
        let created = store.create(&owner, &req, req.validate().unwrap()).unwrap();

        let later = PatternPatch {
            start_time: Some(parse_time_of_day("14:30").unwrap()),
            end_time: Some(parse_time_of_day("15:30").unwrap()),
            end_date: Some(NaiveDate::from_ymd_opt(2024, 6, 1)),
            ..Default::default()
        };
        let updated = store.update(&owner, &created.id, &later).unwrap().unwrap();
        assert_eq!(format_time_of_day(updated.slot.end_time), "15:30");
        assert!(updated.end_date.is_some());

        let open_ended = PatternPatch {
            end_date: Some(None),
            ..Default::default()
        };
        let updated = store.update(&owner, &created.id, &open_ended).unwrap().unwrap();
        assert_eq!(updated.end_date, None);
        let untouched = store
            .update(&owner, &created.id, &PatternPatch::default())
            .unwrap()
            .unwrap();
        assert_eq!(untouched.end_date, None);

        let inverted = PatternPatch {
            end_time: Some(parse_time_of_day("13:00").unwrap()),
            ..Default::default()
        };
        assert!(store.update(&owner, &created.id, &inverted).is_err());
        let read = store.get(&owner, &created.id).unwrap().unwrap();
        assert_eq!(format_time_of_day(read.slot.end_time), "15:30");
    }

    #[test]
    fn delete_reports_existence() {
        let store = store();
        let owner = OwnerId::from("o");
        let req = request();
        let created = store.create(&owner, &req, req.validate().unwrap()).unwrap();
        assert!(!store.delete(&OwnerId::from("x"), &created.id).unwrap());
        assert!(store.delete(&owner, &created.id).unwrap());
        assert!(store.get(&owner, &created.id).unwrap().is_none());
    }
}
