//! Delivery acknowledgement tracking
//!
//! Maps transport message ids back to the originating request id and keeps
//! the derived status monotonic: acks arrive unordered, so a status only
//! moves to an equal or higher ordinal. FAILED overrides everything and is
//! final.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, warn};

use super::config::DeliveryConfig;
use super::events::{EventBus, MessagingEvent};
use crate::storage::{DeliveryStore, DeliveryUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    ServerReceived,
    DeviceDelivered,
    Read,
    Played,
    Failed,
}

impl DeliveryStatus {
    /// Transport acknowledgement code to status
    pub fn from_ack(code: i32) -> Option<Self> {
        match code {
            -1 => Some(Self::Failed),
            0 => Some(Self::Pending),
            1 => Some(Self::ServerReceived),
            2 => Some(Self::DeviceDelivered),
            3 => Some(Self::Read),
            4 => Some(Self::Played),
            _ => None,
        }
    }

    fn ordinal(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Sent => 1,
            Self::ServerReceived => 2,
            Self::DeviceDelivered => 3,
            Self::Read => 4,
            Self::Played => 5,
            Self::Failed => u8::MAX,
        }
    }

    /// Whether `next` may replace `self`
    pub fn accepts(self, next: DeliveryStatus) -> bool {
        match (self, next) {
            (Self::Failed, _) => false,
            (_, Self::Failed) => true,
            _ => next.ordinal() >= self.ordinal(),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "PENDING",
            Self::Sent => "SENT",
            Self::ServerReceived => "SERVER_RECEIVED",
            Self::DeviceDelivered => "DEVICE_DELIVERED",
            Self::Read => "READ",
            Self::Played => "PLAYED",
            Self::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SENT" => Some(Self::Sent),
            "SERVER_RECEIVED" => Some(Self::ServerReceived),
            "DEVICE_DELIVERED" => Some(Self::DeviceDelivered),
            "READ" => Some(Self::Read),
            "PLAYED" => Some(Self::Played),
            "FAILED" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryRecord {
    pub message_id: String,
    pub request_id: String,
    pub ack_code: Option<i32>,
    pub status: DeliveryStatus,
    pub sent_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip)]
    inserted_at: Instant,
}

/// What happened to an acknowledgement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AckOutcome {
    Applied(DeliveryStatus),
    /// Would have regressed the current status
    Stale { current: DeliveryStatus },
    /// No record for this message id (never sent here, or evicted)
    Unknown,
    /// Unrecognised ack code
    Ignored,
}

#[derive(Default)]
struct RecordMap {
    records: HashMap<String, DeliveryRecord>,
    order: VecDeque<(String, Instant)>,
}

impl RecordMap {
    fn evict(&mut self, config: &DeliveryConfig) -> usize {
        let mut evicted = 0;
        while let Some((id, inserted_at)) = self.order.front().cloned() {
            let over_capacity = self.records.len() > config.capacity;
            let expired = inserted_at.elapsed() >= config.ttl;
            if !over_capacity && !expired {
                break;
            }
            self.order.pop_front();
            // The id may have been re-recorded since this entry was queued
            if self
                .records
                .get(&id)
                .map_or(false, |r| r.inserted_at == inserted_at)
            {
                self.records.remove(&id);
                evicted += 1;
            }
        }
        evicted
    }
}

pub struct DeliveryTracker {
    config: DeliveryConfig,
    map: Mutex<RecordMap>,
    store: Arc<dyn DeliveryStore>,
    events: Arc<EventBus>,
}

impl DeliveryTracker {
    pub fn new(config: DeliveryConfig, store: Arc<dyn DeliveryStore>, events: Arc<EventBus>) -> Self {
        Self {
            config,
            map: Mutex::new(RecordMap::default()),
            store,
            events,
        }
    }

    /// Track a successful send and persist it as SENT
    pub async fn record_sent(&self, message_id: &str, request_id: &str) {
        let now = Utc::now();
        let record = DeliveryRecord {
            message_id: message_id.to_string(),
            request_id: request_id.to_string(),
            ack_code: None,
            status: DeliveryStatus::Sent,
            sent_at: now,
            updated_at: now,
            inserted_at: Instant::now(),
        };

        let evicted = {
            let mut map = self.map.lock();
            map.order.push_back((record.message_id.clone(), record.inserted_at));
            map.records.insert(record.message_id.clone(), record);
            map.evict(&self.config)
        };
        if evicted > 0 {
            debug!(evicted, "delivery_records_evicted");
        }

        let update = DeliveryUpdate {
            request_id: request_id.to_string(),
            message_id: message_id.to_string(),
            ack_code: None,
            status: DeliveryStatus::Sent,
            updated_at: now,
        };
        if let Err(e) = self.store.persist_delivery_status(&update).await {
            warn!(request_id, message_id, error = %e, "delivery_persist_failed");
        }
    }

    /// Apply a transport acknowledgement. Never regresses a status.
    pub async fn apply_acknowledgement(&self, message_id: &str, ack_code: i32) -> AckOutcome {
        let Some(status) = DeliveryStatus::from_ack(ack_code) else {
            warn!(message_id, ack_code, "unknown_ack_code");
            return AckOutcome::Ignored;
        };

        let update = {
            let mut map = self.map.lock();
            map.evict(&self.config);

            let Some(record) = map.records.get_mut(message_id) else {
                warn!(message_id, ack_code, "ack_for_unknown_message");
                return AckOutcome::Unknown;
            };

            if !record.status.accepts(status) {
                debug!(
                    message_id,
                    current = %record.status,
                    incoming = %status,
                    "stale_ack_ignored"
                );
                return AckOutcome::Stale {
                    current: record.status,
                };
            }

            record.status = status;
            record.ack_code = Some(ack_code);
            record.updated_at = Utc::now();

            DeliveryUpdate {
                request_id: record.request_id.clone(),
                message_id: record.message_id.clone(),
                ack_code: Some(ack_code),
                status,
                updated_at: record.updated_at,
            }
        };

        if let Err(e) = self.store.persist_delivery_status(&update).await {
            warn!(
                request_id = %update.request_id,
                message_id,
                error = %e,
                "delivery_persist_failed"
            );
        }

        self.events.publish(MessagingEvent::MessageStatus {
            request_id: update.request_id,
            message_id: update.message_id,
            ack_code,
            status,
        });

        AckOutcome::Applied(status)
    }

    pub fn get(&self, message_id: &str) -> Option<DeliveryRecord> {
        self.map.lock().records.get(message_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.map.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
