//! Sync manager: drains the offline transaction queue against the admin
//! dashboard.
//!
//! A drain loads every due `pending` transaction oldest first and submits
//! them one at a time, awaiting each response before the next request so a
//! single device never has more than one stock-affecting call in flight.
//! Only one drain runs per manager; triggers that arrive mid-drain are
//! dropped, since the next timer tick or wake picks up whatever is left.

use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::PosApi;
use crate::background::{WakeBus, WakeReason};
use crate::config::SyncConfig;
use crate::db::DbState;
use crate::error::{ApiError, Result};
use crate::events::{EventHub, OverallStatus, SyncEvent};
use crate::models::{
    now_ms, FailureKind, QueuedTransaction, TransactionPatch, TransactionPayload,
    TransactionStatus,
};
use crate::network::Connectivity;
use crate::queue;

/// What one drain did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub attempted: usize,
    pub synced: usize,
    pub validation_failed: usize,
    pub conflicts: usize,
    /// Transient failures put back in `pending` with a backoff.
    pub retry_scheduled: usize,
    pub permanently_failed: usize,
    /// Set when the drain stopped early (credentials rejected).
    pub aborted: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Another drain held the single-flight flag.
    Skipped,
    Completed(DrainReport),
}

/// Per-transaction result inside a drain.
enum Step {
    Synced,
    ValidationFailed,
    Conflict,
    RetryScheduled,
    PermanentlyFailed,
    /// Credentials rejected; nothing after this can succeed.
    Abort(String),
}

/// Clears the single-flight flag however the drain ends.
struct InFlight<'a>(&'a AtomicBool);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct SyncManager {
    db: Arc<DbState>,
    api: Arc<dyn PosApi>,
    config: SyncConfig,
    events: EventHub,
    network: Connectivity,
    wake: WakeBus,
    in_progress: AtomicBool,
}

impl SyncManager {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn PosApi>,
        config: SyncConfig,
        events: EventHub,
        network: Connectivity,
        wake: WakeBus,
    ) -> Self {
        Self {
            db,
            api,
            config,
            events,
            network,
            wake,
            in_progress: AtomicBool::new(false),
        }
    }

    pub fn events(&self) -> &EventHub {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::SeqCst)
    }

    // -----------------------------------------------------------------------
    // Queue operations
    // -----------------------------------------------------------------------

    /// Persist a sale and, when online, wake the loop to submit it right away.
    pub fn enqueue(&self, payload: TransactionPayload) -> Result<String> {
        let local_id = queue::enqueue(&self.db, payload)?;
        self.refresh_status()?;
        if self.network.is_online() {
            self.wake.wake(WakeReason::Enqueued);
        }
        Ok(local_id)
    }

    /// Put every failed transaction back in `pending` with a fresh retry
    /// budget and wake the loop.
    pub fn retry_failed(&self) -> Result<usize> {
        let reset = queue::reset_failed(&self.db, None)?;
        info!(reset, "failed transactions requeued");
        self.refresh_status()?;
        if reset > 0 {
            self.wake.wake(WakeReason::ManualRetry);
        }
        Ok(reset)
    }

    /// Administrative reset of one failed transaction. Returns `false` when
    /// the record exists but is not `failed`.
    pub fn requeue(&self, local_id: &str) -> Result<bool> {
        if queue::get(&self.db, local_id)?.is_none() {
            return Err(crate::error::SyncError::NotFound(local_id.to_string()));
        }
        let reset = queue::reset_failed(&self.db, Some(local_id))? == 1;
        if reset {
            info!(local_id, "transaction requeued");
            self.refresh_status()?;
            self.wake.wake(WakeReason::ManualRetry);
        }
        Ok(reset)
    }

    pub fn clear_synced(&self) -> Result<usize> {
        let removed = queue::clear_synced(&self.db)?;
        if removed > 0 {
            info!(removed, "synced transactions cleared");
        }
        self.refresh_status()?;
        Ok(removed)
    }

    pub fn get(&self, local_id: &str) -> Result<Option<QueuedTransaction>> {
        queue::get(&self.db, local_id)
    }

    pub fn list_by_status(&self, status: TransactionStatus) -> Result<Vec<QueuedTransaction>> {
        queue::list_by_status(&self.db, status)
    }

    /// Recompute queue counts for the status snapshot.
    pub fn refresh_status(&self) -> Result<()> {
        let counts = queue::counts(&self.db)?;
        self.events.update_status(|s| s.counts = counts);
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Drain
    // -----------------------------------------------------------------------

    pub async fn drain(&self) -> Result<DrainOutcome> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress, trigger dropped");
            return Ok(DrainOutcome::Skipped);
        }
        let _in_flight = InFlight(&self.in_progress);

        self.events.update_status(|s| {
            s.status = OverallStatus::Syncing;
            s.error = None;
        });

        let result = self.drain_queue().await;

        let counts = match queue::counts(&self.db) {
            Ok(counts) => Some(counts),
            Err(e) => {
                warn!(error = %e, "failed to read queue counts, keeping previous");
                None
            }
        };
        self.events.update_status(|s| {
            if let Some(counts) = counts {
                s.counts = counts;
            }
            s.currently_syncing.clear();
            match &result {
                Ok(report) if report.aborted.is_none() => {
                    s.status = OverallStatus::Idle;
                    s.last_sync_at = Some(Utc::now());
                }
                Ok(report) => {
                    s.status = OverallStatus::Error;
                    s.error = report.aborted.clone();
                }
                Err(e) => {
                    s.status = OverallStatus::Error;
                    s.error = Some(e.to_string());
                }
            }
        });

        result.map(DrainOutcome::Completed)
    }

    async fn drain_queue(&self) -> Result<DrainReport> {
        let stale_cutoff = now_ms() - self.config.stale_syncing_after.as_millis() as i64;
        queue::requeue_stale_syncing(&self.db, stale_cutoff)?;

        let due = queue::list_drainable(&self.db, now_ms())?;
        let mut report = DrainReport::default();
        if due.is_empty() {
            return Ok(report);
        }
        info!(count = due.len(), "draining transaction queue");

        for txn in due {
            if !queue::claim_for_sync(&self.db, &txn.local_id)? {
                debug!(local_id = %txn.local_id, "claimed by another drain, skipping");
                continue;
            }
            self.events
                .update_status(|s| s.currently_syncing.push(txn.local_id.clone()));
            report.attempted += 1;

            let step = self.submit(&txn).await?;

            self.events
                .update_status(|s| s.currently_syncing.retain(|id| id != &txn.local_id));
            match step {
                Step::Synced => report.synced += 1,
                Step::ValidationFailed => report.validation_failed += 1,
                Step::Conflict => report.conflicts += 1,
                Step::RetryScheduled => report.retry_scheduled += 1,
                Step::PermanentlyFailed => report.permanently_failed += 1,
                Step::Abort(reason) => {
                    warn!(reason = %reason, "drain aborted");
                    report.aborted = Some(reason);
                    break;
                }
            }
        }

        info!(
            attempted = report.attempted,
            synced = report.synced,
            validation_failed = report.validation_failed,
            conflicts = report.conflicts,
            retry_scheduled = report.retry_scheduled,
            permanently_failed = report.permanently_failed,
            "drain complete"
        );
        Ok(report)
    }

    /// Submit one claimed transaction and record the outcome.
    async fn submit(&self, txn: &QueuedTransaction) -> Result<Step> {
        if txn.retry_count > 0 {
            match self.api.validate_transaction(&txn.payload).await {
                Ok(()) => {}
                Err(ApiError::Validation {
                    message,
                    invalid_items,
                }) => return self.mark_validation_failed(txn, message, invalid_items),
                // Inconclusive: let the checkout itself decide.
                Err(e) => {
                    warn!(local_id = %txn.local_id, error = %e, "pre-flight validation skipped")
                }
            }
        }

        debug!(
            local_id = %txn.local_id,
            reference = %txn.reference_number(),
            retry_count = txn.retry_count,
            "submitting transaction"
        );
        match self.api.checkout(txn).await {
            Ok(ack) => {
                queue::update(
                    &self.db,
                    &txn.local_id,
                    TransactionPatch {
                        status: Some(TransactionStatus::Synced),
                        server_id: Some(Some(ack.server_id.clone())),
                        last_error: Some(None),
                        failure_kind: Some(None),
                        next_retry_at: Some(None),
                        ..Default::default()
                    },
                )?;
                info!(local_id = %txn.local_id, server_id = %ack.server_id, "transaction synced");
                self.events.emit(SyncEvent::Synced {
                    local_id: txn.local_id.clone(),
                    server_id: ack.server_id,
                });
                Ok(Step::Synced)
            }
            Err(ApiError::Validation {
                message,
                invalid_items,
            }) => self.mark_validation_failed(txn, message, invalid_items),
            Err(ApiError::Conflict {
                message,
                server_snapshot,
            }) => {
                let snapshot = if server_snapshot.is_null() {
                    serde_json::json!({ "error": message })
                } else {
                    server_snapshot
                };
                queue::update(
                    &self.db,
                    &txn.local_id,
                    TransactionPatch {
                        status: Some(TransactionStatus::Conflict),
                        server_snapshot: Some(Some(snapshot.clone())),
                        last_error: Some(Some(message)),
                        next_retry_at: Some(None),
                        ..Default::default()
                    },
                )?;
                warn!(local_id = %txn.local_id, "transaction conflicts with server record");
                self.events.emit(SyncEvent::Conflict {
                    local_id: txn.local_id.clone(),
                    server_snapshot: snapshot,
                });
                Ok(Step::Conflict)
            }
            Err(e) if e.is_auth_failure() => {
                // Back to pending untouched; the retry budget is not spent.
                queue::update(
                    &self.db,
                    &txn.local_id,
                    TransactionPatch {
                        status: Some(TransactionStatus::Pending),
                        last_error: Some(Some(e.to_string())),
                        ..Default::default()
                    },
                )?;
                Ok(Step::Abort(e.to_string()))
            }
            Err(e) if e.is_retryable() => self.record_transient_failure(txn, &e),
            Err(e) => self.mark_permanently_failed(txn, txn.retry_count, &e),
        }
    }

    fn mark_validation_failed(
        &self,
        txn: &QueuedTransaction,
        message: String,
        invalid_items: Vec<String>,
    ) -> Result<Step> {
        queue::update(
            &self.db,
            &txn.local_id,
            TransactionPatch {
                status: Some(TransactionStatus::Failed),
                last_error: Some(Some(message.clone())),
                failure_kind: Some(Some(FailureKind::Validation)),
                next_retry_at: Some(None),
                ..Default::default()
            },
        )?;
        warn!(local_id = %txn.local_id, error = %message, "transaction rejected by server");
        self.events.emit(SyncEvent::ValidationError {
            local_id: txn.local_id.clone(),
            message,
            invalid_items,
        });
        Ok(Step::ValidationFailed)
    }

    fn record_transient_failure(&self, txn: &QueuedTransaction, error: &ApiError) -> Result<Step> {
        let retry_count = txn.retry_count + 1;
        if retry_count >= self.config.max_retries {
            return self.mark_permanently_failed(txn, retry_count, error);
        }

        let delay = self.config.backoff_for(retry_count);
        let next_retry_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(60));
        queue::update(
            &self.db,
            &txn.local_id,
            TransactionPatch {
                status: Some(TransactionStatus::Pending),
                retry_count: Some(retry_count),
                last_error: Some(Some(error.to_string())),
                next_retry_at: Some(Some(next_retry_at)),
                ..Default::default()
            },
        )?;
        info!(
            local_id = %txn.local_id,
            retry_count,
            delay_ms = delay.as_millis() as u64,
            error = %error,
            "transient sync failure, retry scheduled"
        );
        Ok(Step::RetryScheduled)
    }

    fn mark_permanently_failed(
        &self,
        txn: &QueuedTransaction,
        retry_count: u32,
        error: &ApiError,
    ) -> Result<Step> {
        queue::update(
            &self.db,
            &txn.local_id,
            TransactionPatch {
                status: Some(TransactionStatus::Failed),
                retry_count: Some(retry_count),
                last_error: Some(Some(error.to_string())),
                failure_kind: Some(Some(FailureKind::Permanent)),
                next_retry_at: Some(None),
                ..Default::default()
            },
        )?;
        warn!(
            local_id = %txn.local_id,
            retry_count,
            error = %error,
            "transaction permanently failed"
        );
        self.events.emit(SyncEvent::Failed {
            local_id: txn.local_id.clone(),
            message: error.to_string(),
            permanent: true,
        });
        Ok(Step::PermanentlyFailed)
    }
}

// ---------------------------------------------------------------------------
// Background sync loop
// ---------------------------------------------------------------------------

/// Start the background sync loop. Drains once at startup, then on every
/// timer tick and every wake broadcast, skipping while offline. The loop
/// only observes cancellation between drains, so a drain in flight always
/// finishes before the task exits.
pub fn start_sync_loop(manager: Arc<SyncManager>, cancel: CancellationToken) -> JoinHandle<()> {
    let mut wake_rx = manager.wake.subscribe();
    let every = manager.config.drain_interval;

    tokio::spawn(async move {
        info!("Sync loop started (interval: {}s)", every.as_secs());
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut first_tick = true;
        let mut was_online: Option<bool> = None;

        loop {
            let reason = tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if std::mem::take(&mut first_tick) {
                        WakeReason::Startup
                    } else {
                        WakeReason::Timer
                    }
                }
                received = wake_rx.recv() => match received {
                    Ok(reason) => reason,
                    Err(RecvError::Lagged(missed)) => {
                        debug!(missed, "wake receiver lagged");
                        WakeReason::Timer
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let online = manager.network.is_online();
            if !online {
                if was_online != Some(false) {
                    info!("Network offline; deferring sync and keeping queue pending");
                }
                was_online = Some(false);
                continue;
            }
            if was_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            was_online = Some(true);

            debug!(?reason, "sync triggered");
            match manager.drain().await {
                Ok(DrainOutcome::Skipped) => {}
                Ok(DrainOutcome::Completed(report)) => {
                    if let Some(reason) = report.aborted {
                        warn!("Sync cycle aborted: {reason}");
                    }
                }
                Err(e) => warn!("Sync cycle failed: {e}"),
            }
        }
        info!("Sync loop stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{network_down, sample_payload, server_down, FakePosApi};
    use std::time::Duration;

    struct Harness {
        api: Arc<FakePosApi>,
        manager: Arc<SyncManager>,
        db: Arc<DbState>,
        wake: WakeBus,
        network: Connectivity,
    }

    fn harness_with(config: SyncConfig) -> Harness {
        let db = Arc::new(DbState::in_memory().unwrap());
        let api = Arc::new(FakePosApi::new());
        let wake = WakeBus::new();
        let network = Connectivity::new(true);
        let manager = Arc::new(SyncManager::new(
            db.clone(),
            api.clone(),
            config,
            EventHub::new(),
            network.clone(),
            wake.clone(),
        ));
        Harness {
            api,
            manager,
            db,
            wake,
            network,
        }
    }

    /// Zero backoff so retries are due immediately.
    fn harness() -> Harness {
        harness_with(SyncConfig {
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
            ..SyncConfig::default()
        })
    }

    fn completed(outcome: DrainOutcome) -> DrainReport {
        match outcome {
            DrainOutcome::Completed(report) => report,
            DrainOutcome::Skipped => panic!("drain was skipped"),
        }
    }

    fn status_of(h: &Harness, id: &str) -> TransactionStatus {
        queue::get(&h.db, id).unwrap().unwrap().status
    }

    #[tokio::test]
    async fn test_offline_queue_submits_in_creation_order() {
        let h = harness();
        h.network.set_online(false);
        let a = h.manager.enqueue(sample_payload("p-a", 1.0, 5.0)).unwrap();
        let b = h.manager.enqueue(sample_payload("p-b", 1.0, 5.0)).unwrap();
        let c = h.manager.enqueue(sample_payload("p-c", 1.0, 5.0)).unwrap();

        h.network.set_online(true);
        let report = completed(h.manager.drain().await.unwrap());

        assert_eq!(report.synced, 3);
        assert_eq!(h.api.submitted(), vec![a.clone(), b, c]);
        let txn = queue::get(&h.db, &a).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Synced);
        assert!(txn.server_id.is_some());
    }

    #[tokio::test]
    async fn test_unreadable_store_keeps_last_counts() {
        let h = harness();
        h.network.set_online(false);
        h.manager.enqueue(sample_payload("p-a", 1.0, 5.0)).unwrap();
        h.manager.enqueue(sample_payload("p-b", 1.0, 5.0)).unwrap();
        assert_eq!(h.manager.events().status().counts.pending, 2);

        h.db.lock()
            .unwrap()
            .execute("DROP TABLE queued_transactions", [])
            .unwrap();
        h.network.set_online(true);
        assert!(h.manager.drain().await.is_err());

        let status = h.manager.events().status();
        assert_eq!(status.status, OverallStatus::Error);
        assert_eq!(status.counts.pending, 2);
        assert!(!h.manager.is_sync_in_progress());
    }

    #[tokio::test]
    async fn test_validation_failure_keeps_retry_count() {
        let h = harness();
        let mut events = h.manager.events().subscribe();
        let id = h.manager.enqueue(sample_payload("p-1", 3.0, 5.0)).unwrap();
        h.api.push_checkout(Err(ApiError::Validation {
            message: "Insufficient stock for Milk 1L".into(),
            invalid_items: vec!["p-1".into()],
        }));

        let report = completed(h.manager.drain().await.unwrap());
        assert_eq!(report.validation_failed, 1);

        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Failed);
        assert_eq!(txn.retry_count, 0);
        assert_eq!(txn.failure_kind, Some(FailureKind::Validation));
        assert_eq!(
            txn.last_error.as_deref(),
            Some("Insufficient stock for Milk 1L")
        );

        match events.recv().await.unwrap() {
            SyncEvent::ValidationError { local_id, message, .. } => {
                assert_eq!(local_id, id);
                assert!(message.contains("Insufficient stock"));
            }
            other => panic!("unexpected event {other:?}"),
        }

        // Not auto-retried.
        completed(h.manager.drain().await.unwrap());
        assert_eq!(h.api.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_three_transient_failures_become_permanent() {
        let h = harness();
        let mut events = h.manager.events().subscribe();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        for _ in 0..3 {
            h.api.push_checkout(Err(server_down()));
        }

        let first = completed(h.manager.drain().await.unwrap());
        assert_eq!(first.retry_scheduled, 1);
        assert_eq!(status_of(&h, &id), TransactionStatus::Pending);
        assert_eq!(queue::get(&h.db, &id).unwrap().unwrap().retry_count, 1);

        completed(h.manager.drain().await.unwrap());
        let third = completed(h.manager.drain().await.unwrap());
        assert_eq!(third.permanently_failed, 1);

        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Failed);
        assert_eq!(txn.retry_count, 3);
        assert_eq!(txn.failure_kind, Some(FailureKind::Permanent));

        let event = loop {
            match events.recv().await.unwrap() {
                e @ SyncEvent::Failed { .. } => break e,
                _ => continue,
            }
        };
        assert_eq!(
            event,
            SyncEvent::Failed {
                local_id: id.clone(),
                message: "Admin dashboard server error (HTTP 503)".into(),
                permanent: true,
            }
        );

        // Never auto-retried again.
        completed(h.manager.drain().await.unwrap());
        assert_eq!(h.api.submitted().len(), 3);
    }

    #[tokio::test]
    async fn test_backoff_defers_retry() {
        let h = harness_with(SyncConfig::default());
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(network_down()));

        completed(h.manager.drain().await.unwrap());
        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        let wait = txn.next_retry_at.unwrap() - Utc::now();
        assert!(wait > chrono::Duration::milliseconds(500));

        // Not yet due.
        let report = completed(h.manager.drain().await.unwrap());
        assert_eq!(report.attempted, 0);
    }

    #[tokio::test]
    async fn test_conflict_is_parked_until_resolved() {
        let h = harness();
        let mut events = h.manager.events().subscribe();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(ApiError::Conflict {
            message: "Transaction conflict detected".into(),
            server_snapshot: serde_json::json!({ "id": "inv-7", "totalAmount": 4.0 }),
        }));

        let report = completed(h.manager.drain().await.unwrap());
        assert_eq!(report.conflicts, 1);

        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Conflict);
        assert_eq!(txn.server_snapshot.unwrap()["id"], "inv-7");
        assert_eq!(txn.payload.totals.total, 5.0, "local version retained");
        assert!(matches!(
            events.recv().await.unwrap(),
            SyncEvent::Conflict { .. }
        ));

        completed(h.manager.drain().await.unwrap());
        assert_eq!(h.api.submitted().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_trigger_is_dropped() {
        let h = harness();
        h.api.set_checkout_delay(Duration::from_millis(50));
        h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();

        let (first, second) = tokio::join!(h.manager.drain(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            assert!(h.manager.is_sync_in_progress());
            h.manager.drain().await
        });

        assert_eq!(completed(first.unwrap()).synced, 1);
        assert_eq!(second.unwrap(), DrainOutcome::Skipped);
        assert_eq!(h.api.submitted().len(), 1);
        assert!(!h.manager.is_sync_in_progress());
    }

    #[tokio::test]
    async fn test_lost_response_does_not_duplicate_order() {
        let h = harness();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout_lost_response(network_down());

        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Pending);

        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Synced);
        assert_eq!(h.api.submitted().len(), 2);
        assert_eq!(h.api.order_count(), 1);
    }

    #[tokio::test]
    async fn test_retry_runs_preflight_validation() {
        let h = harness();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(network_down()));
        completed(h.manager.drain().await.unwrap());

        h.api.push_validate(Err(ApiError::Validation {
            message: "Product not found".into(),
            invalid_items: vec!["p-1".into()],
        }));
        let report = completed(h.manager.drain().await.unwrap());

        assert_eq!(report.validation_failed, 1);
        assert_eq!(h.api.submitted().len(), 1, "checkout short-circuited");
        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        assert_eq!(txn.failure_kind, Some(FailureKind::Validation));
        assert_eq!(txn.retry_count, 1);
    }

    #[tokio::test]
    async fn test_inconclusive_preflight_still_submits() {
        let h = harness();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(network_down()));
        completed(h.manager.drain().await.unwrap());

        h.api.push_validate(Err(network_down()));
        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Synced);
    }

    #[tokio::test]
    async fn test_auth_failure_aborts_without_spending_retries() {
        let h = harness();
        let a = h.manager.enqueue(sample_payload("p-a", 1.0, 5.0)).unwrap();
        let _b = h.manager.enqueue(sample_payload("p-b", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(ApiError::Server {
            status: 401,
            message: "API key is invalid or expired".into(),
        }));

        let report = completed(h.manager.drain().await.unwrap());
        assert!(report.aborted.is_some());
        assert_eq!(h.api.submitted(), vec![a.clone()]);

        let txn = queue::get(&h.db, &a).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(txn.retry_count, 0);
        assert_eq!(h.manager.events().status().status, OverallStatus::Error);
    }

    #[tokio::test]
    async fn test_non_retryable_server_error_fails_immediately() {
        let h = harness();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.api.push_checkout(Err(ApiError::Server {
            status: 413,
            message: "Payload too large".into(),
        }));
        let report = completed(h.manager.drain().await.unwrap());
        assert_eq!(report.permanently_failed, 1);
        assert_eq!(
            queue::get(&h.db, &id).unwrap().unwrap().failure_kind,
            Some(FailureKind::Permanent)
        );
    }

    #[tokio::test]
    async fn test_interrupted_drain_is_recovered() {
        let h = harness_with(SyncConfig {
            stale_syncing_after: Duration::ZERO,
            ..SyncConfig::default()
        });
        let id = queue::enqueue(&h.db, sample_payload("p-1", 1.0, 5.0)).unwrap();
        assert!(queue::claim_for_sync(&h.db, &id).unwrap());

        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Synced);
    }

    #[tokio::test]
    async fn test_retry_failed_resets_budget_and_wakes() {
        let h = harness_with(SyncConfig {
            max_retries: 1,
            ..SyncConfig::default()
        });
        let mut wake_rx = h.wake.subscribe();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        assert_eq!(wake_rx.try_recv().unwrap(), WakeReason::Enqueued);

        h.api.push_checkout(Err(server_down()));
        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Failed);

        assert_eq!(h.manager.retry_failed().unwrap(), 1);
        assert_eq!(wake_rx.try_recv().unwrap(), WakeReason::ManualRetry);
        let txn = queue::get(&h.db, &id).unwrap().unwrap();
        assert_eq!(txn.status, TransactionStatus::Pending);
        assert_eq!(txn.retry_count, 0);

        completed(h.manager.drain().await.unwrap());
        assert_eq!(status_of(&h, &id), TransactionStatus::Synced);
    }

    #[tokio::test]
    async fn test_requeue_single_transaction() {
        let h = harness();
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        assert!(!h.manager.requeue(&id).unwrap(), "pending is not failed");
        assert!(h.manager.requeue("txn_missing").is_err());
    }

    #[tokio::test]
    async fn test_enqueue_offline_does_not_wake() {
        let h = harness();
        let mut wake_rx = h.wake.subscribe();
        h.network.set_online(false);
        h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        assert!(wake_rx.try_recv().is_err());
        assert_eq!(h.manager.events().status().counts.pending, 1);
    }

    #[tokio::test]
    async fn test_status_snapshot_after_drain() {
        let h = harness();
        h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        completed(h.manager.drain().await.unwrap());

        let status = h.manager.events().status();
        assert_eq!(status.status, OverallStatus::Idle);
        assert_eq!(status.counts.synced, 1);
        assert_eq!(status.counts.pending, 0);
        assert!(status.last_sync_at.is_some());
        assert!(status.currently_syncing.is_empty());

        assert_eq!(h.manager.clear_synced().unwrap(), 1);
        assert_eq!(h.manager.events().status().counts.synced, 0);
    }

    #[tokio::test]
    async fn test_loop_drains_on_startup_and_stops_on_cancel() {
        let h = harness_with(SyncConfig {
            drain_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        });
        h.network.set_online(false);
        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        h.network.set_online(true);

        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.manager.clone(), cancel.clone());

        let mut status_rx = h.manager.events().watch_status();
        tokio::time::timeout(Duration::from_secs(2), async {
            while status_rx.borrow().counts.synced == 0 {
                status_rx.changed().await.unwrap();
            }
        })
        .await
        .expect("startup drain");
        assert_eq!(status_of(&h, &id), TransactionStatus::Synced);

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("loop exits")
            .unwrap();
    }

    #[tokio::test]
    async fn test_loop_drains_on_wake() {
        let h = harness_with(SyncConfig {
            drain_interval: Duration::from_secs(3600),
            ..SyncConfig::default()
        });
        let cancel = CancellationToken::new();
        let handle = start_sync_loop(h.manager.clone(), cancel.clone());
        // Let the startup tick pass with an empty queue.
        tokio::time::sleep(Duration::from_millis(20)).await;

        let id = h.manager.enqueue(sample_payload("p-1", 1.0, 5.0)).unwrap();
        tokio::time::timeout(Duration::from_secs(2), async {
            loop {
                if status_of(&h, &id) == TransactionStatus::Synced {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("wake drain");

        cancel.cancel();
        handle.await.unwrap();
    }
}
