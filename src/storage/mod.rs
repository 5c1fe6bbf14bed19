//! Persistence boundary for delivery status and reminder batches

pub mod sqlite;

pub use sqlite::{NewAppointment, SqliteDeliveryStore, StoredDeliveryStatus};

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::messaging::delivery::DeliveryStatus;

/// One status change for an outbound message
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryUpdate {
    pub request_id: String,
    pub message_id: String,
    /// `None` for the initial SENT record
    pub ack_code: Option<i32>,
    pub status: DeliveryStatus,
    pub updated_at: DateTime<Utc>,
}

/// Reminders due on one date, as parallel columns
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReminderBatch {
    pub addresses: Vec<String>,
    pub bodies: Vec<String>,
    pub request_ids: Vec<String>,
}

impl ReminderBatch {
    pub fn len(&self) -> usize {
        self.request_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.request_ids.is_empty()
    }
}

#[async_trait::async_trait]
pub trait DeliveryStore: Send + Sync {
    async fn persist_delivery_status(&self, update: &DeliveryUpdate) -> anyhow::Result<()>;

    async fn fetch_reminder_batch(&self, date: NaiveDate) -> anyhow::Result<ReminderBatch>;
}
