//! Lifecycle notifications from the sync manager.
//!
//! Per-transaction outcomes go out on a `broadcast` channel (every
//! subscriber sees every event; slow subscribers lag rather than block the
//! drain). The aggregate queue status is a `watch` value so late observers
//! always start from the latest snapshot.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};

use crate::queue::QueueCounts;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SyncEvent {
    #[serde(rename = "transaction-synced", rename_all = "camelCase")]
    Synced { local_id: String, server_id: String },

    #[serde(rename = "transaction-validation-error", rename_all = "camelCase")]
    ValidationError {
        local_id: String,
        message: String,
        invalid_items: Vec<String>,
    },

    #[serde(rename = "transaction-conflict", rename_all = "camelCase")]
    Conflict {
        local_id: String,
        server_snapshot: Value,
    },

    /// `permanent` means the retry budget is gone (or the server refused the
    /// sale outright) and only a manual retry will resubmit it.
    #[serde(rename = "transaction-sync-failed", rename_all = "camelCase")]
    Failed {
        local_id: String,
        message: String,
        permanent: bool,
    },
}

impl SyncEvent {
    pub fn local_id(&self) -> &str {
        match self {
            SyncEvent::Synced { local_id, .. }
            | SyncEvent::ValidationError { local_id, .. }
            | SyncEvent::Conflict { local_id, .. }
            | SyncEvent::Failed { local_id, .. } => local_id,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    #[default]
    Idle,
    Syncing,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusSnapshot {
    pub status: OverallStatus,
    pub counts: QueueCounts,
    pub last_sync_at: Option<DateTime<Utc>>,
    /// Local ids submitted by the running drain.
    pub currently_syncing: Vec<String>,
    pub error: Option<String>,
}

/// Fan-out point shared by the sync manager and the conflict resolver.
#[derive(Clone)]
pub struct EventHub {
    events: broadcast::Sender<SyncEvent>,
    status: watch::Sender<SyncStatusSnapshot>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (status, _) = watch::channel(SyncStatusSnapshot::default());
        Self { events, status }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatusSnapshot> {
        self.status.subscribe()
    }

    pub fn status(&self) -> SyncStatusSnapshot {
        self.status.borrow().clone()
    }

    /// Having no subscribers is normal for a headless daemon.
    pub fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }

    pub fn update_status<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncStatusSnapshot),
    {
        self.status.send_modify(f);
    }
}
