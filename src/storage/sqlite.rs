//! SQLite-backed delivery status and reminder storage

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags};
use serde::Serialize;
use tracing::{debug, info, warn};

use super::{DeliveryStore, DeliveryUpdate, ReminderBatch};
use crate::messaging::delivery::DeliveryStatus;

const APPOINTMENT_TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

const SCHEMA_SQL: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;

CREATE TABLE IF NOT EXISTS appointments (
    id TEXT PRIMARY KEY,
    patient_name TEXT NOT NULL,
    phone TEXT,
    appointment_at TEXT NOT NULL,
    message_id TEXT,
    ack_code INTEGER,
    delivery_status TEXT,
    status_updated_at TEXT
) WITHOUT ROWID;

CREATE INDEX IF NOT EXISTS idx_appointments_at
    ON appointments(appointment_at);

CREATE INDEX IF NOT EXISTS idx_appointments_message
    ON appointments(message_id);

-- Every applied status change, in arrival order
CREATE TABLE IF NOT EXISTS delivery_status_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    request_id TEXT NOT NULL,
    message_id TEXT NOT NULL,
    ack_code INTEGER,
    status TEXT NOT NULL,
    recorded_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_delivery_log_request
    ON delivery_status_log(request_id, id);
"#;

/// Appointment to be reminded about
#[derive(Debug, Clone)]
pub struct NewAppointment {
    pub patient_name: String,
    pub phone: Option<String>,
    pub appointment_at: NaiveDateTime,
}

/// Current delivery state of one appointment reminder
#[derive(Debug, Clone, Serialize)]
pub struct StoredDeliveryStatus {
    pub request_id: String,
    pub message_id: Option<String>,
    pub ack_code: Option<i32>,
    pub status: DeliveryStatus,
    pub updated_at: Option<String>,
}

pub struct SqliteDeliveryStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDeliveryStore {
    pub fn new(db_path: &str) -> Result<Self> {
        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE
            | OpenFlags::SQLITE_OPEN_CREATE
            | OpenFlags::SQLITE_OPEN_NO_MUTEX;

        let conn = Connection::open_with_flags(db_path, flags)
            .with_context(|| format!("Failed to open database at {}", db_path))?;

        conn.execute_batch(SCHEMA_SQL)
            .context("Failed to initialize database schema")?;

        let pending: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM appointments WHERE delivery_status IS NULL",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        info!(path = db_path, unsent_reminders = pending, "delivery_store_opened");

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Insert an appointment and return its request id
    pub fn insert_appointment(&self, appointment: &NewAppointment) -> Result<String> {
        let id = uuid::Uuid::new_v4().to_string();
        let at = appointment.appointment_at.format(APPOINTMENT_TS_FORMAT).to_string();

        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO appointments (id, patient_name, phone, appointment_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![id, appointment.patient_name, appointment.phone, at],
        )?;
        Ok(id)
    }

    /// Latest persisted status for a request, if any status was recorded
    pub fn delivery_status(&self, request_id: &str) -> Result<Option<StoredDeliveryStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, message_id, ack_code, delivery_status, status_updated_at \
             FROM appointments WHERE id = ?1",
        )?;

        let mut rows = stmt.query([request_id])?;
        let Some(row) = rows.next()? else {
            return Ok(None);
        };

        let status: Option<String> = row.get(3)?;
        let Some(status) = status.as_deref().and_then(DeliveryStatus::parse) else {
            return Ok(None);
        };

        Ok(Some(StoredDeliveryStatus {
            request_id: row.get(0)?,
            message_id: row.get(1)?,
            ack_code: row.get(2)?,
            status,
            updated_at: row.get(4)?,
        }))
    }

    /// Every status recorded for a request, oldest first
    pub fn status_history(&self, request_id: &str) -> Result<Vec<DeliveryStatus>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT status FROM delivery_status_log WHERE request_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([request_id], |row| row.get::<_, String>(0))?;

        let mut history = Vec::new();
        for status in rows {
            if let Some(parsed) = DeliveryStatus::parse(&status?) {
                history.push(parsed);
            }
        }
        Ok(history)
    }

    fn write_update(&self, update: &DeliveryUpdate) -> Result<()> {
        let updated_at = update.updated_at.to_rfc3339();
        let status = update.status.as_str();

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE appointments SET message_id = ?2, ack_code = ?3, delivery_status = ?4, \
             status_updated_at = ?5 WHERE id = ?1",
            params![
                update.request_id,
                update.message_id,
                update.ack_code,
                status,
                updated_at
            ],
        )?;

        tx.execute(
            "INSERT INTO delivery_status_log (request_id, message_id, ack_code, status, recorded_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                update.request_id,
                update.message_id,
                update.ack_code,
                status,
                updated_at
            ],
        )?;

        tx.commit()?;

        if changed == 0 {
            debug!(request_id = %update.request_id, "status_for_unknown_appointment");
        }
        Ok(())
    }

    fn read_batch(&self, date: NaiveDate) -> Result<ReminderBatch> {
        let day = date.format("%Y-%m-%d").to_string();

        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, patient_name, phone, appointment_at FROM appointments \
             WHERE date(appointment_at) = ?1 \
               AND phone IS NOT NULL AND trim(phone) != '' \
               AND (delivery_status IS NULL OR delivery_status = 'FAILED') \
             ORDER BY appointment_at, id",
        )?;

        let rows = stmt.query_map([&day], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut batch = ReminderBatch::default();
        for row in rows {
            let (id, name, phone, at) = row?;
            let address = normalize_phone(&phone);
            if address.is_empty() {
                warn!(request_id = %id, "appointment_phone_unusable");
                continue;
            }
            batch.addresses.push(address);
            batch.bodies.push(reminder_body(&name, &at));
            batch.request_ids.push(id);
        }
        Ok(batch)
    }
}

#[async_trait::async_trait]
impl DeliveryStore for SqliteDeliveryStore {
    async fn persist_delivery_status(&self, update: &DeliveryUpdate) -> Result<()> {
        self.write_update(update)
    }

    async fn fetch_reminder_batch(&self, date: NaiveDate) -> Result<ReminderBatch> {
        self.read_batch(date)
    }
}

fn normalize_phone(raw: &str) -> String {
    raw.chars().filter(|c| c.is_ascii_digit()).collect()
}

fn reminder_body(patient_name: &str, appointment_at: &str) -> String {
    match NaiveDateTime::parse_from_str(appointment_at, APPOINTMENT_TS_FORMAT) {
        Ok(at) => format!(
            "Hello {}, this is a reminder of your appointment on {} at {}.",
            patient_name,
            at.format("%d/%m/%Y"),
            at.format("%H:%M")
        ),
        Err(_) => format!(
            "Hello {}, this is a reminder of your appointment on {}.",
            patient_name, appointment_at
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn appointment(name: &str, phone: Option<&str>, at: &str) -> NewAppointment {
        NewAppointment {
            patient_name: name.to_string(),
            phone: phone.map(str::to_string),
            appointment_at: NaiveDateTime::parse_from_str(at, APPOINTMENT_TS_FORMAT).unwrap(),
        }
    }

    fn update(request_id: &str, ack_code: Option<i32>, status: DeliveryStatus) -> DeliveryUpdate {
        DeliveryUpdate {
            request_id: request_id.to_string(),
            message_id: "msg-1".to_string(),
            ack_code,
            status,
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_reminder_batch_for_date() {
        let store = SqliteDeliveryStore::new(":memory:").unwrap();
        let late = store
            .insert_appointment(&appointment("Ana", Some("+55 (11) 9999-0001"), "2026-03-10 15:30:00"))
            .unwrap();
        let early = store
            .insert_appointment(&appointment("Bruno", Some("5511999990002"), "2026-03-10 09:00:00"))
            .unwrap();
        store
            .insert_appointment(&appointment("No Phone", None, "2026-03-10 10:00:00"))
            .unwrap();
        store
            .insert_appointment(&appointment("Other Day", Some("5511999990003"), "2026-03-11 10:00:00"))
            .unwrap();

        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let batch = store.fetch_reminder_batch(date).await.unwrap();

        assert_eq!(batch.request_ids, vec![early.clone(), late.clone()]);
        assert_eq!(batch.addresses, vec!["5511999990002", "551199990001"]);
        assert!(batch.bodies[0].contains("Bruno"));
        assert!(batch.bodies[0].contains("10/03/2026 at 09:00"));
    }

    #[tokio::test]
    async fn test_sent_reminders_leave_the_batch() {
        let store = SqliteDeliveryStore::new(":memory:").unwrap();
        let id = store
            .insert_appointment(&appointment("Ana", Some("5511999990001"), "2026-03-10 15:30:00"))
            .unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();

        store
            .persist_delivery_status(&update(&id, None, DeliveryStatus::Sent))
            .await
            .unwrap();
        assert!(store.fetch_reminder_batch(date).await.unwrap().is_empty());

        // A failed delivery becomes eligible again
        store
            .persist_delivery_status(&update(&id, Some(-1), DeliveryStatus::Failed))
            .await
            .unwrap();
        assert_eq!(store.fetch_reminder_batch(date).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_status_persisted_and_logged() {
        let store = SqliteDeliveryStore::new(":memory:").unwrap();
        let id = store
            .insert_appointment(&appointment("Ana", Some("5511999990001"), "2026-03-10 15:30:00"))
            .unwrap();
        assert!(store.delivery_status(&id).unwrap().is_none());

        store
            .persist_delivery_status(&update(&id, None, DeliveryStatus::Sent))
            .await
            .unwrap();
        store
            .persist_delivery_status(&update(&id, Some(3), DeliveryStatus::Read))
            .await
            .unwrap();

        let current = store.delivery_status(&id).unwrap().unwrap();
        assert_eq!(current.status, DeliveryStatus::Read);
        assert_eq!(current.ack_code, Some(3));
        assert_eq!(current.message_id.as_deref(), Some("msg-1"));
        assert_eq!(
            store.status_history(&id).unwrap(),
            vec![DeliveryStatus::Sent, DeliveryStatus::Read]
        );
    }

    #[tokio::test]
    async fn test_status_for_unknown_request_is_logged_only() {
        let store = SqliteDeliveryStore::new(":memory:").unwrap();
        store
            .persist_delivery_status(&update("missing", Some(1), DeliveryStatus::ServerReceived))
            .await
            .unwrap();
        assert!(store.delivery_status("missing").unwrap().is_none());
        assert_eq!(
            store.status_history("missing").unwrap(),
            vec![DeliveryStatus::ServerReceived]
        );
    }

    #[test]
    fn test_on_disk_store_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clinic.db");
        let path = path.to_str().unwrap();

        let id = {
            let store = SqliteDeliveryStore::new(path).unwrap();
            store
                .insert_appointment(&appointment("Ana", Some("5511999990001"), "2026-03-10 15:30:00"))
                .unwrap()
        };

        let reopened = SqliteDeliveryStore::new(path).unwrap();
        let date = NaiveDate::from_ymd_opt(2026, 3, 10).unwrap();
        let batch = reopened.read_batch(date).unwrap();
        assert_eq!(batch.request_ids, vec![id]);
    }
}
