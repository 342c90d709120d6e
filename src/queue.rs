//! Durable queue of sales captured on this device.
//!
//! Every mutation is a single SQLite statement or runs inside one SQLite
//! transaction, so readers never observe a half-applied record. Marking a
//! record `syncing` is a conditional update on `status = 'pending'`: once a
//! drain has claimed a transaction, no other drain (in this process or in
//! another process sharing the file) will see it in the pending set.

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::db::DbState;
use crate::error::{Result, SyncError};
use crate::models::{
    ms_to_datetime, now_ms, ConflictChoice, FailureKind, QueuedTransaction, TransactionPatch,
    TransactionPayload, TransactionStatus,
};

const SELECT_COLUMNS: &str = "local_id, server_id, status, payload, server_snapshot, retry_count,
     last_error, failure_kind, next_retry_at, created_at, updated_at, resolution";

/// Row as stored; JSON columns are decoded outside the rusqlite closure so
/// decode errors surface as `SyncError::Serialization`.
struct RawRow {
    local_id: String,
    server_id: Option<String>,
    status: String,
    payload: String,
    server_snapshot: Option<String>,
    retry_count: i64,
    last_error: Option<String>,
    failure_kind: Option<String>,
    next_retry_at: Option<i64>,
    created_at: i64,
    updated_at: i64,
    resolution: Option<String>,
}

fn read_raw(row: &Row<'_>) -> rusqlite::Result<RawRow> {
    Ok(RawRow {
        local_id: row.get(0)?,
        server_id: row.get(1)?,
        status: row.get(2)?,
        payload: row.get(3)?,
        server_snapshot: row.get(4)?,
        retry_count: row.get(5)?,
        last_error: row.get(6)?,
        failure_kind: row.get(7)?,
        next_retry_at: row.get(8)?,
        created_at: row.get(9)?,
        updated_at: row.get(10)?,
        resolution: row.get(11)?,
    })
}

fn decode(raw: RawRow) -> Result<QueuedTransaction> {
    let status = raw
        .status
        .parse::<TransactionStatus>()
        .map_err(|reason| SyncError::Invariant {
            local_id: raw.local_id.clone(),
            reason,
        })?;
    let server_snapshot = match raw.server_snapshot {
        Some(s) => Some(serde_json::from_str(&s)?),
        None => None,
    };
    Ok(QueuedTransaction {
        payload: serde_json::from_str(&raw.payload)?,
        local_id: raw.local_id,
        server_id: raw.server_id,
        status,
        server_snapshot,
        retry_count: raw.retry_count.max(0) as u32,
        last_error: raw.last_error,
        failure_kind: raw.failure_kind.as_deref().and_then(FailureKind::parse),
        next_retry_at: raw.next_retry_at.map(ms_to_datetime),
        created_at: ms_to_datetime(raw.created_at),
        updated_at: ms_to_datetime(raw.updated_at),
        resolution: raw.resolution.as_deref().and_then(ConflictChoice::parse),
    })
}

fn query_many(
    conn: &Connection,
    sql: &str,
    args: &[&dyn rusqlite::ToSql],
) -> Result<Vec<QueuedTransaction>> {
    let mut stmt = conn.prepare(sql)?;
    let raws = stmt
        .query_map(args, read_raw)?
        .collect::<rusqlite::Result<Vec<RawRow>>>()?;
    raws.into_iter().map(decode).collect()
}

fn fetch(conn: &Connection, local_id: &str) -> Result<Option<QueuedTransaction>> {
    let raw = conn
        .query_row(
            &format!("SELECT {SELECT_COLUMNS} FROM queued_transactions WHERE local_id = ?1"),
            params![local_id],
            read_raw,
        )
        .optional()?;
    raw.map(decode).transpose()
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Globally unique, immutable client id: `txn_<unix ms>_<12 hex>`.
pub fn generate_local_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("txn_{}_{}", now_ms(), &suffix[..12])
}

/// Human-facing receipt number, also sent as the idempotency key:
/// `RCP-YYYYMMDD-HHMMSS-XXXXXX`.
pub fn generate_reference_number() -> String {
    let now = Utc::now();
    let suffix = Uuid::new_v4().simple().to_string().to_uppercase();
    format!("RCP-{}-{}", now.format("%Y%m%d-%H%M%S"), &suffix[..6])
}

// ---------------------------------------------------------------------------
// Contract
// ---------------------------------------------------------------------------

/// Persist a new sale in `pending` and return its local id.
pub fn enqueue(db: &DbState, mut payload: TransactionPayload) -> Result<String> {
    if payload.reference_number.trim().is_empty() {
        payload.reference_number = generate_reference_number();
    }
    let local_id = generate_local_id();
    let now = now_ms();
    let json = serde_json::to_string(&payload)?;

    let conn = db.lock()?;
    conn.execute(
        "INSERT INTO queued_transactions (
             local_id, reference_number, status, payload, retry_count, created_at, updated_at
         ) VALUES (?1, ?2, 'pending', ?3, 0, ?4, ?4)",
        params![local_id, payload.reference_number, json, now],
    )?;

    info!(
        local_id = %local_id,
        reference = %payload.reference_number,
        items = payload.items.len(),
        "Transaction queued"
    );
    Ok(local_id)
}

pub fn get(db: &DbState, local_id: &str) -> Result<Option<QueuedTransaction>> {
    let conn = db.lock()?;
    fetch(&conn, local_id)
}

/// Apply `patch` atomically. Rejects edges outside the state machine and
/// writes that would break the `synced`/`conflict` invariants.
pub fn update(db: &DbState, local_id: &str, patch: TransactionPatch) -> Result<QueuedTransaction> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;

    let current =
        fetch(&tx, local_id)?.ok_or_else(|| SyncError::NotFound(local_id.to_string()))?;
    let next = apply_patch(current, patch)?;

    let payload_json = serde_json::to_string(&next.payload)?;
    let snapshot_json = next
        .server_snapshot
        .as_ref()
        .map(serde_json::to_string)
        .transpose()?;
    tx.execute(
        "UPDATE queued_transactions
         SET server_id = ?1,
             status = ?2,
             payload = ?3,
             server_snapshot = ?4,
             retry_count = ?5,
             last_error = ?6,
             failure_kind = ?7,
             next_retry_at = ?8,
             updated_at = ?9,
             resolution = ?10
         WHERE local_id = ?11",
        params![
            next.server_id,
            next.status.as_str(),
            payload_json,
            snapshot_json,
            next.retry_count as i64,
            next.last_error,
            next.failure_kind.map(|k| k.as_str()),
            next.next_retry_at.map(|t| t.timestamp_millis()),
            next.updated_at.timestamp_millis(),
            next.resolution.map(|c| c.as_str()),
            next.local_id,
        ],
    )?;
    tx.commit()?;

    debug!(
        local_id = %next.local_id,
        status = %next.status,
        retry_count = next.retry_count,
        "Transaction updated"
    );
    Ok(next)
}

fn apply_patch(current: QueuedTransaction, patch: TransactionPatch) -> Result<QueuedTransaction> {
    let from = current.status;
    let mut next = current;

    if let Some(status) = patch.status {
        if !from.can_transition_to(status) {
            return Err(SyncError::InvalidTransition {
                local_id: next.local_id,
                from,
                to: status,
            });
        }
        next.status = status;
    } else if from == TransactionStatus::Synced {
        return Err(SyncError::InvalidTransition {
            local_id: next.local_id,
            from,
            to: from,
        });
    }

    if let Some(server_id) = patch.server_id {
        next.server_id = server_id;
    }
    if let Some(payload) = patch.payload {
        next.payload = payload;
    }
    if let Some(snapshot) = patch.server_snapshot {
        next.server_snapshot = snapshot;
    }
    if let Some(retry_count) = patch.retry_count {
        next.retry_count = retry_count;
    }
    if let Some(last_error) = patch.last_error {
        next.last_error = last_error;
    }
    if let Some(kind) = patch.failure_kind {
        next.failure_kind = kind;
    }
    if let Some(at) = patch.next_retry_at {
        next.next_retry_at = at;
    }
    if let Some(resolution) = patch.resolution {
        next.resolution = resolution;
    }

    if next.status == TransactionStatus::Synced && next.server_id.is_none() {
        return Err(SyncError::Invariant {
            local_id: next.local_id,
            reason: "synced transactions must carry a server id".into(),
        });
    }
    if next.status == TransactionStatus::Conflict && next.server_snapshot.is_none() {
        return Err(SyncError::Invariant {
            local_id: next.local_id,
            reason: "conflicted transactions must retain the server snapshot".into(),
        });
    }

    next.updated_at = Utc::now();
    Ok(next)
}

/// All transactions with `status`, oldest first.
pub fn list_by_status(db: &DbState, status: TransactionStatus) -> Result<Vec<QueuedTransaction>> {
    let conn = db.lock()?;
    query_many(
        &conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM queued_transactions
             WHERE status = ?1
             ORDER BY created_at ASC, seq ASC"
        ),
        &[&status.as_str()],
    )
}

/// Pending transactions whose backoff has elapsed, oldest first. Records
/// already claimed by a drain are `syncing` and never appear here.
pub fn list_drainable(db: &DbState, now: i64) -> Result<Vec<QueuedTransaction>> {
    let conn = db.lock()?;
    query_many(
        &conn,
        &format!(
            "SELECT {SELECT_COLUMNS} FROM queued_transactions
             WHERE status = 'pending'
               AND (next_retry_at IS NULL OR next_retry_at <= ?1)
             ORDER BY created_at ASC, seq ASC"
        ),
        &[&now],
    )
}

/// Move one transaction from `pending` to `syncing`. Returns `false` when
/// another drain got there first.
pub fn claim_for_sync(db: &DbState, local_id: &str) -> Result<bool> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE queued_transactions
         SET status = 'syncing', updated_at = ?1
         WHERE local_id = ?2 AND status = 'pending'",
        params![now_ms(), local_id],
    )?;
    Ok(changed == 1)
}

pub fn delete(db: &DbState, local_id: &str) -> Result<bool> {
    let conn = db.lock()?;
    let removed = conn.execute(
        "DELETE FROM queued_transactions WHERE local_id = ?1",
        params![local_id],
    )?;
    Ok(removed > 0)
}

/// Return transactions stuck in `syncing` since before `cutoff_ms` (the
/// process died mid-drain) to `pending`. The idempotency key makes the
/// resubmission safe.
pub fn requeue_stale_syncing(db: &DbState, cutoff_ms: i64) -> Result<usize> {
    let conn = db.lock()?;
    let changed = conn.execute(
        "UPDATE queued_transactions
         SET status = 'pending', updated_at = ?1
         WHERE status = 'syncing' AND updated_at <= ?2",
        params![now_ms(), cutoff_ms],
    )?;
    if changed > 0 {
        info!(requeued = changed, "Requeued interrupted transactions");
    }
    Ok(changed)
}

/// Manual reset of failed transactions to `pending` with a fresh retry
/// budget. `None` resets every failed transaction.
pub fn reset_failed(db: &DbState, local_id: Option<&str>) -> Result<usize> {
    let conn = db.lock()?;
    let now = now_ms();
    let changed = match local_id {
        Some(id) => conn.execute(
            "UPDATE queued_transactions
             SET status = 'pending', retry_count = 0, last_error = NULL,
                 failure_kind = NULL, next_retry_at = NULL, updated_at = ?1
             WHERE status = 'failed' AND local_id = ?2",
            params![now, id],
        )?,
        None => conn.execute(
            "UPDATE queued_transactions
             SET status = 'pending', retry_count = 0, last_error = NULL,
                 failure_kind = NULL, next_retry_at = NULL, updated_at = ?1
             WHERE status = 'failed'",
            params![now],
        )?,
    };
    Ok(changed)
}

pub fn clear_synced(db: &DbState) -> Result<usize> {
    let conn = db.lock()?;
    Ok(conn.execute(
        "DELETE FROM queued_transactions WHERE status = 'synced'",
        [],
    )?)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueCounts {
    pub pending: u64,
    pub syncing: u64,
    pub synced: u64,
    pub failed: u64,
    pub conflict: u64,
}

pub fn counts(db: &DbState) -> Result<QueueCounts> {
    let conn = db.lock()?;
    let mut stmt =
        conn.prepare("SELECT status, COUNT(*) FROM queued_transactions GROUP BY status")?;
    let rows = stmt
        .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut counts = QueueCounts::default();
    for (status, n) in rows {
        let n = n.max(0) as u64;
        match status.parse::<TransactionStatus>() {
            Ok(TransactionStatus::Pending) => counts.pending = n,
            Ok(TransactionStatus::Syncing) => counts.syncing = n,
            Ok(TransactionStatus::Synced) => counts.synced = n,
            Ok(TransactionStatus::Failed) => counts.failed = n,
            Ok(TransactionStatus::Conflict) => counts.conflict = n,
            Err(_) => {}
        }
    }
    Ok(counts)
}
