use std::sync::{Mutex, MutexGuard};

use cadence_core::{new_row_id, parse_db_timestamp, to_db_timestamp, OwnerId};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use tracing::{debug, info};

use super::{collect_rows, conversion_error, QuotaStore};
use crate::{
    db::init_db,
    error::{BookingError, Result},
    types::{Quota, QuotaRequest, QuotaStatus},
};

const SELECT_QUOTA: &str = "SELECT id, owner_id, client_id, name, total_credits, total_price,
        price_per_credit, validity_days, activated_at, status, paid, created_at, updated_at
    FROM quotas";

pub struct SqliteQuotaStore {
    conn: Mutex<Connection>,
}

impl SqliteQuotaStore {
    pub fn new(conn: Connection) -> Result<Self> {
        init_db(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| BookingError::TransientStore("quota store lock poisoned".to_string()))
    }
}

impl QuotaStore for SqliteQuotaStore {
    fn create(&self, owner: &OwnerId, request: &QuotaRequest) -> Result<Quota> {
        request.validate()?;
        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<String> = tx
            .query_row(
                "SELECT id FROM quotas
                 WHERE owner_id = ?1 AND client_id = ?2 AND status = 'active' LIMIT 1",
                rusqlite::params![owner.as_str(), request.client_id],
                |row| row.get(0),
            )
            .optional()?;
        if let Some(id) = existing {
            return Err(BookingError::invalid(format!(
                "client {} already has an active quota ({id})",
                request.client_id
            )));
        }

        let now = to_db_timestamp(Utc::now());
        let quota = Quota {
            id: new_row_id(),
            owner_id: owner.clone(),
            client_id: request.client_id.clone(),
            name: request.name.clone(),
            total_credits: request.total_credits,
            total_price: request.total_price,
            price_per_credit: request.price_per_credit(),
            validity_days: request.validity_days,
            activated_at: None,
            status: QuotaStatus::Active,
            paid: false,
            created_at: now.clone(),
            updated_at: now,
        };
        tx.execute(
            "INSERT INTO quotas (id, owner_id, client_id, name, total_credits, total_price,
                price_per_credit, validity_days, activated_at, status, paid,
                created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, NULL, 'active', 0, ?9, ?10)",
            rusqlite::params![
                quota.id,
                quota.owner_id.as_str(),
                quota.client_id,
                quota.name,
                quota.total_credits,
                quota.total_price,
                quota.price_per_credit,
                quota.validity_days,
                quota.created_at,
                quota.updated_at,
            ],
        )?;
        tx.commit()?;
        debug!(quota_id = %quota.id, client = %quota.client_id, "quota created");
        Ok(quota)
    }

    fn get(&self, owner: &OwnerId, id: &str) -> Result<Option<Quota>> {
        let conn = self.lock()?;
        let quota = conn
            .query_row(
                &format!("{SELECT_QUOTA} WHERE id = ?1 AND owner_id = ?2"),
                rusqlite::params![id, owner.as_str()],
                row_to_quota,
            )
            .optional()?;
        Ok(quota)
    }

    fn find_active(&self, owner: &OwnerId, client_id: &str) -> Result<Option<Quota>> {
        let conn = self.lock()?;
        let quota = conn
            .query_row(
                &format!(
                    "{SELECT_QUOTA} WHERE owner_id = ?1 AND client_id = ?2 AND status = 'active'
                     ORDER BY created_at LIMIT 1"
                ),
                rusqlite::params![owner.as_str(), client_id],
                row_to_quota,
            )
            .optional()?;
        Ok(quota)
    }

    fn list_active(&self) -> Result<Vec<Quota>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "{SELECT_QUOTA} WHERE status = 'active' ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([], row_to_quota)?;
        let quotas = collect_rows("quota", rows);
        Ok(quotas)
    }

    fn set_activation_date_if_unset(
        &self,
        owner: &OwnerId,
        id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE quotas SET activated_at = ?1, updated_at = ?2
             WHERE id = ?3 AND owner_id = ?4 AND activated_at IS NULL",
            rusqlite::params![
                to_db_timestamp(at),
                to_db_timestamp(Utc::now()),
                id,
                owner.as_str()
            ],
        )?;
        if n > 0 {
            debug!(quota_id = %id, activated_at = %at, "quota activated");
        }
        Ok(n > 0)
    }

    fn set_status(&self, owner: &OwnerId, id: &str, status: QuotaStatus) -> Result<bool> {
        let conn = self.lock()?;
        let n = conn.execute(
            "UPDATE quotas SET status = ?1, updated_at = ?2
             WHERE id = ?3 AND owner_id = ?4 AND status = 'active'",
            rusqlite::params![
                status.to_string(),
                to_db_timestamp(Utc::now()),
                id,
                owner.as_str()
            ],
        )?;
        if n > 0 {
            info!(quota_id = %id, %status, "quota status changed");
        }
        Ok(n > 0)
    }
}

fn row_to_quota(row: &rusqlite::Row<'_>) -> rusqlite::Result<Quota> {
    let owner_id: String = row.get(1)?;
    let activated_at: Option<String> = row.get(8)?;
    let status: String = row.get(9)?;
    Ok(Quota {
        id: row.get(0)?,
        owner_id: OwnerId(owner_id),
        client_id: row.get(2)?,
        name: row.get(3)?,
        total_credits: row.get(4)?,
        total_price: row.get(5)?,
        price_per_credit: row.get(6)?,
        validity_days: row.get(7)?,
        activated_at: activated_at
            .as_deref()
            .map(parse_db_timestamp)
            .transpose()
            .map_err(|e| conversion_error(8, e))?,
        status: status.parse().map_err(|e: BookingError| conversion_error(9, e))?,
        paid: row.get(10)?,
        created_at: row.get(11)?,
        updated_at: row.get(12)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store() -> SqliteQuotaStore {
        SqliteQuotaStore::new(Connection::open_in_memory().unwrap()).unwrap()
    }

    fn request(client: &str) -> QuotaRequest {
        QuotaRequest {
            client_id: client.into(),
            name: "10-pack".into(),
            total_credits: 10,
            total_price: 450.0,
            validity_days: 90,
        }
    }

    #[test]
    fn one_active_quota_per_client() {
        let store = store();
        let owner = OwnerId::from("o");
        let quota = store.create(&owner, &request("c1")).unwrap();
        assert!((quota.price_per_credit - 45.0).abs() < 1e-9);

        let err = store.create(&owner, &request("c1")).unwrap_err();
        assert_eq!(err.code(), "INVALID_ARGUMENT");
        // Another client, or another owner, is fine.
        store.create(&owner, &request("c2")).unwrap();
        store.create(&OwnerId::from("p"), &request("c1")).unwrap();

        // Once the first one is terminal a new one may be bought.
        assert!(store.set_status(&owner, &quota.id, QuotaStatus::Canceled).unwrap());
        store.create(&owner, &request("c1")).unwrap();
    }

    #[test]
    fn terminal_status_never_moves_back() {
        let store = store();
        let owner = OwnerId::from("o");
        let quota = store.create(&owner, &request("c1")).unwrap();
        assert!(store.set_status(&owner, &quota.id, QuotaStatus::Expired).unwrap());
        assert!(!store.set_status(&owner, &quota.id, QuotaStatus::Active).unwrap());
        assert!(!store.set_status(&owner, &quota.id, QuotaStatus::Canceled).unwrap());
        let read = store.get(&owner, &quota.id).unwrap().unwrap();
        assert_eq!(read.status, QuotaStatus::Expired);
        assert!(store.find_active(&owner, "c1").unwrap().is_none());
        assert!(store.list_active().unwrap().is_empty());
    }

    #[test]
    fn activation_date_is_set_once() {
        let store = store();
        let owner = OwnerId::from("o");
        let quota = store.create(&owner, &request("c1")).unwrap();
        let first = Utc::now();
        assert!(store.set_activation_date_if_unset(&owner, &quota.id, first).unwrap());
        assert!(!store
            .set_activation_date_if_unset(&owner, &quota.id, first + Duration::days(3))
            .unwrap());
        let read = store.find_active(&owner, "c1").unwrap().unwrap();
        assert_eq!(
            read.activated_at.map(to_db_timestamp),
            Some(to_db_timestamp(first))
        );
    }
}
