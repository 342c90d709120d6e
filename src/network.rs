//! Shared connectivity flag.
//!
//! Written by the connectivity monitor, read by every component that must
//! not touch the network while offline. Observers can await transitions on
//! the `watch` side.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

#[derive(Clone)]
pub struct Connectivity {
    online: Arc<AtomicBool>,
    tx: Arc<watch::Sender<bool>>,
}

impl Connectivity {
    pub fn new(initially_online: bool) -> Self {
        let (tx, _) = watch::channel(initially_online);
        Self {
            online: Arc::new(AtomicBool::new(initially_online)),
            tx: Arc::new(tx),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Record the latest probe result. Returns `true` on an offline→online
    /// transition.
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!(online, "connectivity changed");
            self.tx.send_replace(online);
        }
        !was && online
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reports_only_offline_to_online() {
        let net = Connectivity::new(false);
        assert!(!net.is_online());
        assert!(net.set_online(true));
        assert!(!net.set_online(true), "already online");
        assert!(!net.set_online(false));
        assert!(net.set_online(true));
    }

    #[tokio::test]
    async fn test_watchers_see_transitions() {
        let net = Connectivity::new(true);
        let mut rx = net.subscribe();
        net.set_online(false);
        rx.changed().await.unwrap();
        assert!(!*rx.borrow());
    }
}
