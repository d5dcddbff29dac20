//! Durable record of events that already alerted the user.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use meetring_core::store::{self, keys};
use meetring_core::{CalendarEvent, KeyValueStore, StoreResult};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessedEntry {
    pub id: String,
    /// Start of the event when it was processed; `None` for legacy entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processed_at: Option<DateTime<Utc>>,
}

/// Older stores kept bare id strings.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredEntry {
    Id(String),
    Entry(ProcessedEntry),
}

impl From<StoredEntry> for ProcessedEntry {
    fn from(stored: StoredEntry) -> Self {
        match stored {
            StoredEntry::Id(id) => Self {
                id,
                start_time: None,
                processed_at: None,
            },
            StoredEntry::Entry(entry) => entry,
        }
    }
}

/// Reads and writes `processed_event_ids`.
///
/// Every call re-reads the store; nothing is cached between calls.
pub struct DedupTracker {
    store: Arc<dyn KeyValueStore>,
    /// Serializes read-modify-write cycles within this process.
    lock: Mutex<()>,
}

impl DedupTracker {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    pub async fn entries(&self) -> StoreResult<Vec<ProcessedEntry>> {
        let stored: Option<Vec<StoredEntry>> =
            store::read(self.store.as_ref(), keys::PROCESSED_EVENT_IDS).await?;
        Ok(stored
            .unwrap_or_default()
            .into_iter()
            .map(ProcessedEntry::from)
            .collect())
    }

    pub async fn is_processed(&self, event_id: &str) -> StoreResult<bool> {
        Ok(self.entries().await?.iter().any(|e| e.id == event_id))
    }

    /// Records `event` as processed. Returns `false` if it already was.
    ///
    /// Returns only after the write reached the store.
    pub async fn mark_processed(
        &self,
        event: &CalendarEvent,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let _guard = self.lock.lock().await;
        let mut entries = self.entries().await?;
        if entries.iter().any(|e| e.id == event.id) {
            return Ok(false);
        }
        entries.push(ProcessedEntry {
            id: event.id.clone(),
            start_time: Some(event.start_time),
            processed_at: Some(now),
        });
        store::write(self.store.as_ref(), keys::PROCESSED_EVENT_IDS, &entries).await?;
        debug!(event_id = %event.id, "marked processed");
        Ok(true)
    }

    /// Drops entries whose event started more than `retention` before `now`.
    ///
    /// Entries without a start time are kept. Returns how many were dropped.
    pub async fn prune(&self, now: DateTime<Utc>, retention: Duration) -> StoreResult<usize> {
        let _guard = self.lock.lock().await;
        let entries = self.entries().await?;
        let cutoff = now - retention;
        let before = entries.len();
        let kept: Vec<ProcessedEntry> = entries
            .into_iter()
            .filter(|e| e.start_time.is_none_or(|start| start >= cutoff))
            .collect();
        let dropped = before - kept.len();
        if dropped > 0 {
            store::write(self.store.as_ref(), keys::PROCESSED_EVENT_IDS, &kept).await?;
            info!(dropped, remaining = kept.len(), "pruned processed events");
        }
        Ok(dropped)
    }
}
