//! Conflict resolver: human adjudication of transactions the server reported
//! as already modified.
//!
//! A conflicted record keeps both the queued payload and the server's last
//! known snapshot. Resolving it calls `POST resolve-conflict` and then marks
//! the record `synced`; a record that is already `synced` is left untouched,
//! which makes repeated resolution a no-op.

use serde_json::Value;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::api::{PosApi, ResolveRequest};
use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::events::{EventHub, SyncEvent};
use crate::models::{
    ConflictChoice, QueuedTransaction, TransactionPatch, TransactionPayload, TransactionStatus,
};
use crate::queue;

#[derive(Debug, Clone, PartialEq)]
pub enum ResolveOutcome {
    /// The server accepted the resolution and the record is now `synced`.
    Resolved(QueuedTransaction),
    /// The record was already `synced`; nothing was sent.
    AlreadyResolved(QueuedTransaction),
}

impl ResolveOutcome {
    pub fn transaction(&self) -> &QueuedTransaction {
        match self {
            ResolveOutcome::Resolved(txn) | ResolveOutcome::AlreadyResolved(txn) => txn,
        }
    }
}

pub struct ConflictResolver {
    db: Arc<DbState>,
    api: Arc<dyn PosApi>,
    events: EventHub,
    /// Held from the status check until the record is marked `synced`.
    resolving: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(db: Arc<DbState>, api: Arc<dyn PosApi>, events: EventHub) -> Self {
        Self {
            db,
            api,
            events,
            resolving: Mutex::new(()),
        }
    }

    /// Transactions waiting for a decision, oldest first.
    pub fn list_conflicts(&self) -> Result<Vec<QueuedTransaction>> {
        queue::list_by_status(&self.db, TransactionStatus::Conflict)
    }

    /// Apply `choice` to a conflicted transaction.
    ///
    /// `local_snapshot` is the version the cashier reviewed; when omitted the
    /// queued payload is used. It only matters for [`ConflictChoice::Local`].
    /// Server errors leave the record in `conflict` so the call can be
    /// repeated. Overlapping calls are serialised; the later one sees the
    /// record already `synced`.
    pub async fn resolve(
        &self,
        local_id: &str,
        choice: ConflictChoice,
        local_snapshot: Option<TransactionPayload>,
    ) -> Result<ResolveOutcome> {
        let _resolving = self.resolving.lock().await;
        let txn = queue::get(&self.db, local_id)?
            .ok_or_else(|| SyncError::NotFound(local_id.to_string()))?;

        match txn.status {
            TransactionStatus::Conflict => {}
            TransactionStatus::Synced => {
                if txn.resolution.is_some_and(|previous| previous != choice) {
                    warn!(
                        local_id,
                        requested = choice.as_str(),
                        "conflict already resolved the other way, ignoring"
                    );
                }
                return Ok(ResolveOutcome::AlreadyResolved(txn));
            }
            status => {
                return Err(SyncError::NotInConflict {
                    local_id: local_id.to_string(),
                    status,
                })
            }
        }

        let snapshot = txn.server_snapshot.clone().unwrap_or(Value::Null);
        let transaction_id = server_record_id(&snapshot)
            .or_else(|| txn.server_id.clone())
            .unwrap_or_else(|| txn.reference_number().to_string());

        let (payload, server_id) = match choice {
            ConflictChoice::Server => {
                let response = self
                    .api
                    .resolve_conflict(&ResolveRequest {
                        transaction_id: transaction_id.clone(),
                        resolution: ConflictChoice::Server,
                        local_data: None,
                    })
                    .await?;
                let record = if response.is_object() { &response } else { &snapshot };
                let mut payload = txn.payload.clone();
                payload.adopt_server_record(record);
                let server_id = server_record_id(record).unwrap_or(transaction_id);
                (payload, server_id)
            }
            ConflictChoice::Local => {
                let mut payload = local_snapshot.unwrap_or_else(|| txn.payload.clone());
                // The reference number identifies the sale; a snapshot cannot move it.
                payload.reference_number = txn.payload.reference_number.clone();
                let response = self
                    .api
                    .resolve_conflict(&ResolveRequest {
                        transaction_id: transaction_id.clone(),
                        resolution: ConflictChoice::Local,
                        local_data: Some(payload.to_resolution_data()),
                    })
                    .await?;
                let server_id = server_record_id(&response).unwrap_or(transaction_id);
                (payload, server_id)
            }
        };

        let patch = TransactionPatch {
            status: Some(TransactionStatus::Synced),
            server_id: Some(Some(server_id.clone())),
            payload: Some(payload),
            last_error: Some(None),
            resolution: Some(Some(choice)),
            ..Default::default()
        };
        let updated = match queue::update(&self.db, local_id, patch) {
            Ok(updated) => updated,
            // Another process sharing the store resolved it meanwhile.
            Err(SyncError::InvalidTransition {
                from: TransactionStatus::Synced,
                ..
            }) => {
                let current = queue::get(&self.db, local_id)?
                    .ok_or_else(|| SyncError::NotFound(local_id.to_string()))?;
                warn!(local_id, "conflict resolved concurrently, keeping the stored outcome");
                return Ok(ResolveOutcome::AlreadyResolved(current));
            }
            Err(e) => return Err(e),
        };
        info!(
            local_id,
            server_id = %server_id,
            resolution = choice.as_str(),
            "conflict resolved"
        );

        let counts = queue::counts(&self.db)?;
        self.events.update_status(|s| s.counts = counts);
        self.events.emit(SyncEvent::Synced {
            local_id: local_id.to_string(),
            server_id,
        });
        Ok(ResolveOutcome::Resolved(updated))
    }
}

/// Server records carry their id as a string or a number.
fn server_record_id(record: &Value) -> Option<String> {
    match record.get("id")? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
