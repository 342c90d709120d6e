//! Catalog sync service: bulk-loads the product catalog and its images into
//! the local cache for offline checkout.
//!
//! Phases: `idle -> fetching -> caching-images -> complete`, or `error`
//! from any stage. Every progress change is broadcast to subscribers and
//! the latest value is kept for late readers.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::api::{ImageBlob, PosApi};
use crate::catalog;
use crate::db::DbState;
use crate::error::{ApiError, Result};
use crate::models::{now_ms, CacheStats, SyncPhase, SyncProgress};
use crate::network::Connectivity;

const PROGRESS_CHANNEL_CAPACITY: usize = 256;

/// `(product id, url, download result)` from one image task.
type ImageFetch = (String, String, std::result::Result<ImageBlob, ApiError>);

pub const ERR_ALREADY_SYNCING: &str = "Sync already in progress";
pub const ERR_OFFLINE: &str = "No internet connection";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSyncResult {
    /// Whether the catalog fetch itself succeeded. Image failures do not
    /// affect it.
    pub success: bool,
    pub products_count: u64,
    pub categories_count: u64,
    pub images_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CatalogSyncResult {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            ..Default::default()
        }
    }
}

struct Syncing<'a>(&'a AtomicBool);

impl Drop for Syncing<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

pub struct ProductSyncService {
    db: Arc<DbState>,
    api: Arc<dyn PosApi>,
    network: Connectivity,
    image_concurrency: usize,
    syncing: AtomicBool,
    current: Mutex<SyncProgress>,
    progress_tx: broadcast::Sender<SyncProgress>,
}

impl ProductSyncService {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn PosApi>,
        network: Connectivity,
        image_concurrency: usize,
    ) -> Self {
        let (progress_tx, _) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);
        Self {
            db,
            api,
            network,
            image_concurrency: image_concurrency.max(1),
            syncing: AtomicBool::new(false),
            current: Mutex::new(SyncProgress::default()),
            progress_tx,
        }
    }

    pub fn is_sync_in_progress(&self) -> bool {
        self.syncing.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> SyncProgress {
        self.current
            .lock()
            .map(|p| p.clone())
            .unwrap_or_default()
    }

    /// Every progress change from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncProgress> {
        self.progress_tx.subscribe()
    }

    fn update_progress<F>(&self, f: F)
    where
        F: FnOnce(&mut SyncProgress),
    {
        let snapshot = match self.current.lock() {
            Ok(mut progress) => {
                f(&mut progress);
                progress.clone()
            }
            Err(_) => return,
        };
        let _ = self.progress_tx.send(snapshot);
    }

    // -----------------------------------------------------------------------
    // Full sync
    // -----------------------------------------------------------------------

    pub async fn sync_all(&self) -> CatalogSyncResult {
        if self
            .syncing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return CatalogSyncResult::failed(ERR_ALREADY_SYNCING);
        }
        let _syncing = Syncing(&self.syncing);

        if !self.network.is_online() {
            return CatalogSyncResult::failed(ERR_OFFLINE);
        }

        // A finished run settles back to idle before the next one starts.
        if matches!(self.progress().phase, SyncPhase::Complete | SyncPhase::Error) {
            self.update_progress(|p| *p = SyncProgress::default());
        }
        self.update_progress(|p| {
            *p = SyncProgress {
                phase: SyncPhase::Fetching,
                ..Default::default()
            }
        });

        match self.run().await {
            Ok(result) => {
                self.update_progress(|p| p.phase = SyncPhase::Complete);
                info!(
                    products = result.products_count,
                    categories = result.categories_count,
                    images = result.images_count,
                    "catalog sync complete"
                );
                result
            }
            Err(e) => {
                let message = e.to_string();
                warn!(error = %message, "catalog sync failed");
                self.update_progress(|p| {
                    p.phase = SyncPhase::Error;
                    p.error = Some(message.clone());
                });
                CatalogSyncResult::failed(message)
            }
        }
    }

    async fn run(&self) -> Result<CatalogSyncResult> {
        let snapshot = self.api.fetch_catalog().await?;
        let total = snapshot.products.len() as u64;
        self.update_progress(|p| p.total_products = total);

        catalog::replace_catalog(&self.db, &snapshot.products)?;
        let synced_at = snapshot.synced_at.unwrap_or_else(now_ms);
        catalog::set_last_sync_time(&self.db, synced_at)?;

        let images: Vec<(String, String)> = snapshot
            .products
            .iter()
            .filter_map(|p| {
                p.image_url
                    .as_deref()
                    .filter(|url| !url.trim().is_empty())
                    .map(|url| (p.id.clone(), url.to_string()))
            })
            .collect();
        let total_images = images.len() as u64;
        self.update_progress(|p| {
            p.synced_products = total;
            p.phase = SyncPhase::CachingImages;
            p.total_images = total_images;
            p.cached_images = 0;
        });

        let cached = self.cache_images(images).await;
        let stats = catalog::stats(&self.db)?;
        Ok(CatalogSyncResult {
            success: true,
            products_count: total,
            categories_count: stats.categories_count,
            images_count: cached,
            error: None,
        })
    }

    /// Download images with at most `image_concurrency` requests in flight.
    /// Failures are logged and skipped. Returns how many were stored.
    async fn cache_images(&self, images: Vec<(String, String)>) -> u64 {
        let mut queue = images.into_iter();
        let mut in_flight: JoinSet<ImageFetch> = JoinSet::new();
        let mut cached = 0u64;

        let spawn_next = |set: &mut JoinSet<ImageFetch>, next: Option<(String, String)>| {
            if let Some((product_id, url)) = next {
                let api = self.api.clone();
                set.spawn(async move {
                    let blob = api.fetch_image(&url).await;
                    (product_id, url, blob)
                });
            }
        };
        for _ in 0..self.image_concurrency {
            spawn_next(&mut in_flight, queue.next());
        }

        while let Some(joined) = in_flight.join_next().await {
            spawn_next(&mut in_flight, queue.next());
            let (product_id, url, blob) = match joined {
                Ok(done) => done,
                Err(e) => {
                    warn!(error = %e, "image download task failed");
                    continue;
                }
            };
            let stored = blob.map_err(crate::error::SyncError::from).and_then(|blob| {
                catalog::upsert_image(&self.db, &product_id, &blob.mime_type, &blob.data)
            });
            match stored {
                Ok(()) => {
                    cached += 1;
                    self.update_progress(|p| p.cached_images = cached);
                }
                Err(e) => debug!(product_id = %product_id, url = %url, error = %e, "image skipped"),
            }
        }
        cached
    }

    // -----------------------------------------------------------------------
    // Cache management
    // -----------------------------------------------------------------------

    /// Wipe every cached product, category and image and reset progress.
    pub fn clear_cache(&self) -> Result<()> {
        catalog::clear(&self.db)?;
        self.update_progress(|p| *p = SyncProgress::default());
        Ok(())
    }

    pub fn stats(&self) -> Result<CacheStats> {
        catalog::stats(&self.db)
    }

    pub fn last_sync_time(&self) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
        catalog::last_sync_time(&self.db)
    }

    pub fn has_cached_data(&self) -> Result<bool> {
        catalog::has_cached_data(&self.db)
    }

    /// Products with an image URL but no cached image (`product id -> URL`).
    pub fn missing_images(&self) -> Result<HashMap<String, String>> {
        let mut sources = catalog::image_sources(&self.db)?;
        sources.retain(|product_id, _| {
            matches!(catalog::get_image(&self.db, product_id), Ok(None))
        });
        Ok(sources)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::CatalogSnapshot;
    use crate::test_support::{catalog_product, network_down, FakePosApi};
    use std::time::Duration;

    fn service(online: bool) -> (Arc<DbState>, Arc<FakePosApi>, ProductSyncService) {
        let db = Arc::new(DbState::in_memory().unwrap());
        let api = Arc::new(FakePosApi::new());
        let svc = ProductSyncService::new(db.clone(), api.clone(), Connectivity::new(online), 2);
        (db, api, svc)
    }

    fn png() -> ImageBlob {
        ImageBlob {
            mime_type: "image/png".into(),
            data: vec![0x89, b'P', b'N', b'G'],
        }
    }

    fn three_product_catalog(api: &FakePosApi) {
        let mut tea = catalog_product("p-3", "Tea", None);
        tea.category = Some("Drinks".into());
        tea.category_id = Some("c-drinks".into());
        api.set_catalog(Ok(CatalogSnapshot {
            products: vec![
                catalog_product("p-1", "Bread", Some("https://cdn.test/p-1.png")),
                catalog_product("p-2", "Milk", Some("https://cdn.test/p-2.png")),
                tea,
            ],
            synced_at: Some(1_700_000_000_000),
        }));
        api.set_image("https://cdn.test/p-1.png", Ok(png()));
        api.set_image("https://cdn.test/p-2.png", Ok(png()));
    }

    fn drain(rx: &mut broadcast::Receiver<SyncProgress>) -> Vec<SyncProgress> {
        let mut seen = Vec::new();
        while let Ok(p) = rx.try_recv() {
            seen.push(p);
        }
        seen
    }

    #[tokio::test]
    async fn test_full_sync_walks_phases_with_monotonic_counters() {
        let (db, api, svc) = service(true);
        three_product_catalog(&api);
        let mut rx = svc.subscribe();

        let result = svc.sync_all().await;
        assert_eq!(
            result,
            CatalogSyncResult {
                success: true,
                products_count: 3,
                categories_count: 2,
                images_count: 2,
                error: None,
            }
        );

        let updates = drain(&mut rx);
        let mut phases: Vec<SyncPhase> = updates.iter().map(|p| p.phase).collect();
        phases.dedup();
        assert_eq!(
            phases,
            vec![SyncPhase::Fetching, SyncPhase::CachingImages, SyncPhase::Complete]
        );
        for pair in updates.windows(2) {
            assert!(pair[1].synced_products >= pair[0].synced_products);
            assert!(pair[1].cached_images >= pair[0].cached_images);
        }
        let last = updates.last().unwrap();
        assert_eq!(last.synced_products, last.total_products);
        assert_eq!(last.cached_images, last.total_images);

        let stats = catalog::stats(&db).unwrap();
        assert_eq!(
            stats,
            CacheStats {
                products_count: 3,
                categories_count: 2,
                images_count: 2,
            }
        );
        assert_eq!(
            catalog::last_sync_time(&db).unwrap().unwrap().timestamp_millis(),
            1_700_000_000_000
        );
    }

    #[tokio::test]
    async fn test_resync_is_idempotent() {
        let (db, api, svc) = service(true);
        three_product_catalog(&api);

        let first = svc.sync_all().await;
        let products_before = catalog::get_products(&db, &Default::default()).unwrap();
        let second = svc.sync_all().await;
        let products_after = catalog::get_products(&db, &Default::default()).unwrap();

        assert_eq!(first, second);
        assert_eq!(catalog::stats(&db).unwrap().products_count, 3);
        let strip = |products: Vec<crate::models::CachedProduct>| {
            products
                .into_iter()
                .map(|mut p| {
                    p.last_synced_at = crate::models::ms_to_datetime(0);
                    p
                })
                .collect::<Vec<_>>()
        };
        assert_eq!(strip(products_before), strip(products_after));
    }

    #[tokio::test]
    async fn test_next_run_resets_to_idle_first() {
        let (_db, api, svc) = service(true);
        api.set_catalog(Err(network_down()));
        svc.sync_all().await;
        assert_eq!(svc.progress().phase, SyncPhase::Error);

        three_product_catalog(&api);
        let mut rx = svc.subscribe();
        assert!(svc.sync_all().await.success);

        let updates = drain(&mut rx);
        assert_eq!(updates[0], SyncProgress::default());
        let mut phases: Vec<SyncPhase> = updates.iter().map(|p| p.phase).collect();
        phases.dedup();
        assert_eq!(
            phases,
            vec![
                SyncPhase::Idle,
                SyncPhase::Fetching,
                SyncPhase::CachingImages,
                SyncPhase::Complete,
            ]
        );

        let mut rx = svc.subscribe();
        svc.sync_all().await;
        assert_eq!(drain(&mut rx)[0].phase, SyncPhase::Idle);
    }

    #[tokio::test]
    async fn test_image_failure_does_not_fail_sync() {
        let (db, api, svc) = service(true);
        api.set_catalog(Ok(CatalogSnapshot {
            products: vec![
                catalog_product("p-1", "Bread", Some("https://cdn.test/p-1.png")),
                catalog_product("p-2", "Milk", Some("https://cdn.test/missing.png")),
            ],
            synced_at: None,
        }));
        api.set_image("https://cdn.test/p-1.png", Ok(png()));

        let result = svc.sync_all().await;
        assert!(result.success);
        assert_eq!(result.images_count, 1);
        assert_eq!(svc.progress().phase, SyncPhase::Complete);
        assert_eq!(svc.progress().total_images, 2);
        assert!(!catalog::get_product(&db, "p-2").unwrap().unwrap().has_local_image);
        assert_eq!(svc.missing_images().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_failure_ends_in_error_phase() {
        let (_db, api, svc) = service(true);
        api.set_catalog(Err(network_down()));

        let result = svc.sync_all().await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("Cannot reach"));
        let progress = svc.progress();
        assert_eq!(progress.phase, SyncPhase::Error);
        assert!(progress.error.is_some());
        assert!(!svc.is_sync_in_progress());
    }

    #[tokio::test]
    async fn test_offline_returns_without_touching_progress() {
        let (_db, api, svc) = service(false);
        let result = svc.sync_all().await;
        assert_eq!(result.error.as_deref(), Some(ERR_OFFLINE));
        assert_eq!(svc.progress(), SyncProgress::default());
        assert_eq!(api.catalog_fetches.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_sync_while_running_is_refused() {
        let (_db, api, svc) = service(true);
        three_product_catalog(&api);
        api.set_catalog_delay(Duration::from_millis(50));

        let (first, second) = tokio::join!(svc.sync_all(), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            svc.sync_all().await
        });
        assert!(first.success);
        assert_eq!(second.error.as_deref(), Some(ERR_ALREADY_SYNCING));
        assert_eq!(api.catalog_fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_clear_cache_resets_to_idle() {
        let (db, api, svc) = service(true);
        three_product_catalog(&api);
        svc.sync_all().await;
        assert!(svc.has_cached_data().unwrap());

        svc.clear_cache().unwrap();
        assert_eq!(catalog::stats(&db).unwrap(), CacheStats::default());
        assert_eq!(svc.progress().phase, SyncPhase::Idle);
        assert!(svc.last_sync_time().unwrap().is_none());
    }
}
