//! Offline transaction sync engine for the POS terminal.
//!
//! Sales are captured into a durable SQLite queue and drained against the
//! admin dashboard whenever the terminal is online. A companion catalog cache
//! keeps products and images available for checkout while offline.
//!
//! [`Engine`] wires the pieces together the same way for the `pos-sync`
//! daemon and for embedders: a foreground store for reads and enqueues, a
//! background store for the sync loop, and one shared connectivity flag,
//! wake bus and event hub.

use std::path::Path;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub mod api;
pub mod background;
pub mod catalog;
pub mod config;
pub mod conflict;
pub mod db;
pub mod error;
pub mod events;
pub mod logging;
pub mod models;
pub mod network;
pub mod offline_products;
pub mod product_sync;
pub mod queue;
pub mod storage;
pub mod sync;

#[cfg(test)]
mod test_support;

pub use api::{HttpPosApi, PosApi};
pub use config::SyncConfig;
pub use conflict::{ConflictResolver, ResolveOutcome};
pub use error::{ApiError, Result, SyncError};
pub use events::{EventHub, OverallStatus, SyncEvent, SyncStatusSnapshot};
pub use models::{ConflictChoice, QueuedTransaction, TransactionPayload, TransactionStatus};
pub use offline_products::{ListingSource, OfflineProducts, ProductListing};
pub use product_sync::{CatalogSyncResult, ProductSyncService};
pub use sync::{DrainOutcome, DrainReport, SyncManager};

use background::WakeBus;
use db::DbState;
use network::Connectivity;

/// Every component of the sync engine, sharing one set of channels.
pub struct Engine {
    pub config: SyncConfig,
    /// Foreground store: catalog reads, enqueues, conflict resolution.
    pub db: Arc<DbState>,
    pub sync: Arc<SyncManager>,
    pub conflicts: ConflictResolver,
    pub catalog: Arc<ProductSyncService>,
    pub products: OfflineProducts,
    pub network: Connectivity,
    pub wake: WakeBus,
    pub events: EventHub,
    api: Arc<dyn PosApi>,
}

impl Engine {
    /// Open (or create) the store under `data_dir`, load configuration from
    /// it, then build the API client with that configuration.
    pub fn open<F>(data_dir: &Path, make_api: F) -> Result<Self>
    where
        F: FnOnce(&SyncConfig) -> Result<Arc<dyn PosApi>>,
    {
        let foreground = Arc::new(db::init(data_dir)?);
        let config = SyncConfig::load(&foreground)?;
        let api = make_api(&config)?;
        let background = Arc::new(db::init(data_dir)?);
        Ok(Self::with_stores(foreground, background, api, config))
    }

    pub fn with_stores(
        foreground: Arc<DbState>,
        background: Arc<DbState>,
        api: Arc<dyn PosApi>,
        config: SyncConfig,
    ) -> Self {
        // Offline until the first health probe says otherwise.
        let network = Connectivity::new(false);
        let wake = WakeBus::new();
        let events = EventHub::new();

        let sync = Arc::new(SyncManager::new(
            background,
            api.clone(),
            config.clone(),
            events.clone(),
            network.clone(),
            wake.clone(),
        ));
        let conflicts = ConflictResolver::new(foreground.clone(), api.clone(), events.clone());
        let catalog = Arc::new(ProductSyncService::new(
            foreground.clone(),
            api.clone(),
            network.clone(),
            config.image_concurrency,
        ));
        let products = OfflineProducts::new(
            foreground.clone(),
            api.clone(),
            catalog.clone(),
            network.clone(),
            true,
        );

        Self {
            config,
            db: foreground,
            sync,
            conflicts,
            catalog,
            products,
            network,
            wake,
            events,
            api,
        }
    }

    /// Spawn the sync loop, the connectivity monitor and (on Unix) the
    /// SIGUSR1 wake listener. All of them stop when `cancel` fires.
    pub fn start(&self, cancel: CancellationToken) -> Vec<JoinHandle<()>> {
        let mut handles = vec![
            sync::start_sync_loop(self.sync.clone(), cancel.clone()),
            background::start_connectivity_monitor(
                self.api.clone(),
                self.network.clone(),
                self.wake.clone(),
                self.config.connectivity_interval,
                cancel.clone(),
            ),
        ];

        #[cfg(unix)]
        match background::start_signal_listener(self.wake.clone(), cancel.clone()) {
            Ok(handle) => handles.push(handle),
            Err(e) => warn!("SIGUSR1 wake unavailable: {e}"),
        }

        info!(
            drain_interval_secs = self.config.drain_interval.as_secs(),
            max_retries = self.config.max_retries,
            "sync engine started"
        );
        handles
    }
}
