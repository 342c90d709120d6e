//! Offline-first product reads for the checkout screen.
//!
//! Cache first. On a cache miss the first read of the session may trigger a
//! catalog sync; after that the admin dashboard is asked directly, and if
//! that fails too a cache filled in the meantime is served as a degraded
//! fallback.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

use crate::api::{CatalogProduct, PosApi};
use crate::catalog::{self, ProductQuery, LEGACY_CATEGORY_PREFIX};
use crate::db::DbState;
use crate::error::{ApiError, Result};
use crate::models::{CachedCategory, CachedImage, CachedProduct};
use crate::network::Connectivity;
use crate::product_sync::{ProductSyncService, ERR_OFFLINE};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ListingSource {
    Cache,
    Network,
    /// Network read failed; cached data from an earlier sync was served.
    DegradedCache,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineProduct {
    #[serde(flatten)]
    pub product: CachedProduct,
    /// `data:` URL of the cached image, when there is one.
    pub cached_image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProductListing {
    pub products: Vec<OfflineProduct>,
    pub source: ListingSource,
}

impl ProductListing {
    pub fn is_using_cache(&self) -> bool {
        self.source != ListingSource::Network
    }
}

/// Cached image as a `data:<mime>;base64,...` URL.
pub fn image_data_url(image: &CachedImage) -> String {
    format!(
        "data:{};base64,{}",
        image.mime_type,
        BASE64_STANDARD.encode(&image.data)
    )
}

fn from_network(product: CatalogProduct) -> OfflineProduct {
    OfflineProduct {
        product: CachedProduct {
            id: product.id,
            name: product.name,
            sku: product.sku,
            unit_price: product.unit_price,
            marked_price: product.marked_price,
            current_stock: product.current_stock,
            unit: product.unit,
            category: product.category,
            category_id: product.category_id,
            image_url: product.image_url,
            barcode: product.barcode,
            has_local_image: false,
            last_synced_at: Utc::now(),
        },
        cached_image_url: None,
    }
}

pub struct OfflineProducts {
    db: Arc<DbState>,
    api: Arc<dyn PosApi>,
    sync: Arc<ProductSyncService>,
    network: Connectivity,
    auto_sync: bool,
    auto_sync_triggered: AtomicBool,
}

impl OfflineProducts {
    pub fn new(
        db: Arc<DbState>,
        api: Arc<dyn PosApi>,
        sync: Arc<ProductSyncService>,
        network: Connectivity,
        auto_sync: bool,
    ) -> Self {
        Self {
            db,
            api,
            sync,
            network,
            auto_sync,
            auto_sync_triggered: AtomicBool::new(false),
        }
    }

    pub async fn list(&self, query: &ProductQuery) -> Result<ProductListing> {
        if catalog::has_cached_data(&self.db)? {
            return self.from_cache(query, ListingSource::Cache);
        }

        // At most one automatic catalog sync per session.
        if self.auto_sync
            && self.network.is_online()
            && !self.auto_sync_triggered.swap(true, Ordering::SeqCst)
        {
            info!("No cached products; syncing catalog for offline use");
            let result = self.sync.sync_all().await;
            if result.success {
                info!(products = result.products_count, "catalog synced for offline use");
                if catalog::has_cached_data(&self.db)? {
                    return self.from_cache(query, ListingSource::Cache);
                }
            } else if let Some(error) = &result.error {
                warn!(error = %error, "automatic catalog sync failed");
            }
        }

        match self.from_network(query).await {
            Ok(listing) => Ok(listing),
            Err(e) => {
                if catalog::has_cached_data(&self.db)? {
                    warn!(error = %e, "product listing failed; using offline product data");
                    self.from_cache(&ProductQuery::default(), ListingSource::DegradedCache)
                } else {
                    Err(e.into())
                }
            }
        }
    }

    fn from_cache(&self, query: &ProductQuery, source: ListingSource) -> Result<ProductListing> {
        let products = catalog::get_products(&self.db, query)?
            .into_iter()
            .map(|product| {
                let cached_image_url = if product.has_local_image {
                    self.cached_image_url(&product.id)?
                } else {
                    None
                };
                Ok(OfflineProduct {
                    product,
                    cached_image_url,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(ProductListing { products, source })
    }

    async fn from_network(
        &self,
        query: &ProductQuery,
    ) -> std::result::Result<ProductListing, ApiError> {
        if !self.network.is_online() {
            return Err(ApiError::Network(ERR_OFFLINE.into()));
        }
        let category = query.category_id.as_deref().filter(|c| !c.is_empty());
        let legacy_name = category.and_then(|c| c.strip_prefix(LEGACY_CATEGORY_PREFIX));
        let server_category = if legacy_name.is_some() { None } else { category };

        let products = self
            .api
            .list_products(query.search.as_deref(), server_category)
            .await?
            .into_iter()
            .filter(|p| match legacy_name {
                Some(name) => p.category.as_deref() == Some(name),
                None => true,
            })
            .map(from_network)
            .collect();
        Ok(ProductListing {
            products,
            source: ListingSource::Network,
        })
    }

    pub fn get_categories(&self) -> Result<Vec<CachedCategory>> {
        catalog::get_categories(&self.db)
    }

    pub fn cached_image_url(&self, product_id: &str) -> Result<Option<String>> {
        Ok(catalog::get_image(&self.db, product_id)?.map(|image| image_data_url(&image)))
    }
}
