//! Background trigger: everything that can wake the sync loop.
//!
//! The trigger itself holds no state. It only broadcasts a [`WakeReason`];
//! every subscribed loop reacts by invoking the same single-flight drain,
//! so a wake that arrives mid-drain is harmless.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::api::PosApi;
use crate::network::Connectivity;

const WAKE_CHANNEL_CAPACITY: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeReason {
    Startup,
    Timer,
    ConnectivityRestored,
    /// OS-level wake (SIGUSR1 from a scheduler or a network-up hook).
    Signal,
    Enqueued,
    ManualRetry,
}

#[derive(Clone)]
pub struct WakeBus {
    tx: broadcast::Sender<WakeReason>,
}

impl Default for WakeBus {
    fn default() -> Self {
        Self::new()
    }
}

impl WakeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(WAKE_CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Returns how many listeners were notified.
    pub fn wake(&self, reason: WakeReason) -> usize {
        match self.tx.send(reason) {
            Ok(n) => {
                debug!(?reason, listeners = n, "wake broadcast");
                n
            }
            Err(_) => 0,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WakeReason> {
        self.tx.subscribe()
    }
}

// ---------------------------------------------------------------------------
// Connectivity monitor
// ---------------------------------------------------------------------------

/// One health probe. Broadcasts a wake on an offline→online transition and
/// returns the probe result.
pub async fn probe_connectivity(api: &dyn PosApi, network: &Connectivity, wake: &WakeBus) -> bool {
    let online = match api.health().await {
        Ok(latency) => {
            debug!(latency_ms = latency.as_millis() as u64, "health probe ok");
            true
        }
        Err(e) => {
            debug!(error = %e, "health probe failed");
            false
        }
    };
    if network.set_online(online) {
        info!("Network restored; waking sync");
        wake.wake(WakeReason::ConnectivityRestored);
    }
    online
}

pub fn start_connectivity_monitor(
    api: Arc<dyn PosApi>,
    network: Connectivity,
    wake: WakeBus,
    every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("Connectivity monitor started (interval: {}s)", every.as_secs());
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    probe_connectivity(api.as_ref(), &network, &wake).await;
                }
            }
        }
        info!("Connectivity monitor stopped");
    })
}

// ---------------------------------------------------------------------------
// OS wake
// ---------------------------------------------------------------------------

/// Forward SIGUSR1 to the wake bus until cancelled.
#[cfg(unix)]
pub fn start_signal_listener(
    wake: WakeBus,
    cancel: CancellationToken,
) -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut usr1 = signal(SignalKind::user_defined1())?;
    Ok(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                received = usr1.recv() => {
                    if received.is_none() {
                        break;
                    }
                    info!("SIGUSR1 received; waking sync");
                    wake.wake(WakeReason::Signal);
                }
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::FakePosApi;

    #[test]
    fn test_wake_reaches_every_instance() {
        let bus = WakeBus::new();
        let mut a = bus.subscribe();
        let mut b = bus.subscribe();
        assert_eq!(bus.wake(WakeReason::Signal), 2);
        assert_eq!(a.try_recv().unwrap(), WakeReason::Signal);
        assert_eq!(b.try_recv().unwrap(), WakeReason::Signal);
    }

    #[test]
    fn test_wake_without_listeners_is_noop() {
        assert_eq!(WakeBus::new().wake(WakeReason::Timer), 0);
    }

    #[tokio::test]
    async fn test_probe_wakes_only_on_restore() {
        let api = FakePosApi::new();
        let network = Connectivity::new(true);
        let bus = WakeBus::new();
        let mut rx = bus.subscribe();

        api.set_health_down(true);
        assert!(!probe_connectivity(&api, &network, &bus).await);
        assert!(!network.is_online());
        assert!(rx.try_recv().is_err());

        api.set_health_down(false);
        assert!(probe_connectivity(&api, &network, &bus).await);
        assert_eq!(rx.try_recv().unwrap(), WakeReason::ConnectivityRestored);

        // Still online: no second wake.
        probe_connectivity(&api, &network, &bus).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_monitor_stops_on_cancel() {
        let api: Arc<dyn PosApi> = Arc::new(FakePosApi::new());
        let cancel = CancellationToken::new();
        let handle = start_connectivity_monitor(
            api,
            Connectivity::new(false),
            WakeBus::new(),
            Duration::from_millis(10),
            cancel.clone(),
        );
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("monitor exits")
            .unwrap();
    }
}
