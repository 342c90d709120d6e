//! In-memory `PosApi` and fixtures shared by the unit tests.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::api::{CatalogProduct, CatalogSnapshot, CheckoutAck, ImageBlob, PosApi, ResolveRequest};
use crate::error::ApiError;
use crate::models::{LineItem, PaymentBreakdown, QueuedTransaction, Totals, TransactionPayload};

pub fn sample_payload(product_id: &str, quantity: f64, price: f64) -> TransactionPayload {
    let total = quantity * price;
    TransactionPayload {
        items: vec![LineItem {
            product_id: product_id.to_string(),
            name: None,
            quantity,
            price,
            discount: None,
        }],
        totals: Totals {
            subtotal: total,
            tax_amount: 0.0,
            tax_percent: None,
            discount: 0.0,
            total,
        },
        payment: PaymentBreakdown {
            method: "CASH".into(),
            amount_paid: total,
            cash_amount: Some(total),
            ..Default::default()
        },
        customer: None,
        reference_number: String::new(),
        extra: Map::new(),
    }
}

pub fn catalog_product(id: &str, name: &str, image_url: Option<&str>) -> CatalogProduct {
    CatalogProduct {
        id: id.into(),
        name: name.into(),
        sku: None,
        unit_price: 10.0,
        marked_price: None,
        current_stock: 5.0,
        unit: None,
        category: Some("General".into()),
        category_id: Some("c-general".into()),
        image_url: image_url.map(str::to_string),
        barcode: None,
    }
}

pub fn network_down() -> ApiError {
    ApiError::Network("Cannot reach admin dashboard at https://admin.test".into())
}

pub fn server_down() -> ApiError {
    ApiError::Server {
        status: 503,
        message: "Admin dashboard server error".into(),
    }
}

enum CheckoutStep {
    Accept,
    Reject(ApiError),
    /// Order is created server-side but the response never arrives.
    LoseResponse(ApiError),
}

/// Scripted server. Checkouts without a scripted outcome succeed, and the
/// same reference number always maps to the same server order.
#[derive(Default)]
pub struct FakePosApi {
    checkout_script: Mutex<VecDeque<CheckoutStep>>,
    validate_script: Mutex<VecDeque<Result<(), ApiError>>>,
    resolve_script: Mutex<VecDeque<Result<Value, ApiError>>>,
    catalog: Mutex<Option<Result<CatalogSnapshot, ApiError>>>,
    listing: Mutex<Option<Result<Vec<CatalogProduct>, ApiError>>>,
    images: Mutex<HashMap<String, Result<ImageBlob, ApiError>>>,
    health_down: AtomicBool,
    checkout_delay: Mutex<Option<Duration>>,
    catalog_delay: Mutex<Option<Duration>>,
    listing_delay: Mutex<Option<Duration>>,
    resolve_delay: Mutex<Option<Duration>>,

    /// Local ids in submission order.
    pub submitted: Mutex<Vec<String>>,
    pub validated: Mutex<Vec<String>>,
    pub resolutions: Mutex<Vec<ResolveRequest>>,
    /// Reference number -> server id, one entry per order created.
    pub orders: Mutex<HashMap<String, String>>,
    pub catalog_fetches: AtomicUsize,
    pub listing_fetches: AtomicUsize,
}

impl FakePosApi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_checkout(&self, outcome: Result<(), ApiError>) {
        let step = match outcome {
            Ok(()) => CheckoutStep::Accept,
            Err(e) => CheckoutStep::Reject(e),
        };
        self.checkout_script.lock().unwrap().push_back(step);
    }

    pub fn push_checkout_lost_response(&self, error: ApiError) {
        self.checkout_script
            .lock()
            .unwrap()
            .push_back(CheckoutStep::LoseResponse(error));
    }

    pub fn push_validate(&self, outcome: Result<(), ApiError>) {
        self.validate_script.lock().unwrap().push_back(outcome);
    }

    pub fn push_resolve(&self, outcome: Result<Value, ApiError>) {
        self.resolve_script.lock().unwrap().push_back(outcome);
    }

    pub fn set_catalog(&self, outcome: Result<CatalogSnapshot, ApiError>) {
        *self.catalog.lock().unwrap() = Some(outcome);
    }

    pub fn set_listing(&self, outcome: Result<Vec<CatalogProduct>, ApiError>) {
        *self.listing.lock().unwrap() = Some(outcome);
    }

    pub fn set_image(&self, url: &str, outcome: Result<ImageBlob, ApiError>) {
        self.images.lock().unwrap().insert(url.to_string(), outcome);
    }

    pub fn set_health_down(&self, down: bool) {
        self.health_down.store(down, Ordering::SeqCst);
    }

    pub fn set_checkout_delay(&self, delay: Duration) {
        *self.checkout_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_catalog_delay(&self, delay: Duration) {
        *self.catalog_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_listing_delay(&self, delay: Duration) {
        *self.listing_delay.lock().unwrap() = Some(delay);
    }

    pub fn set_resolve_delay(&self, delay: Duration) {
        *self.resolve_delay.lock().unwrap() = Some(delay);
    }

    pub fn submitted(&self) -> Vec<String> {
        self.submitted.lock().unwrap().clone()
    }

    pub fn order_count(&self) -> usize {
        self.orders.lock().unwrap().len()
    }
}

#[async_trait]
impl PosApi for FakePosApi {
    async fn checkout(&self, txn: &QueuedTransaction) -> Result<CheckoutAck, ApiError> {
        self.submitted.lock().unwrap().push(txn.local_id.clone());
        let delay = *self.checkout_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let step = self
            .checkout_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(CheckoutStep::Accept);
        let lost = match step {
            CheckoutStep::Reject(e) => return Err(e),
            CheckoutStep::LoseResponse(e) => Some(e),
            CheckoutStep::Accept => None,
        };
        let mut orders = self.orders.lock().unwrap();
        let next = format!("srv-{}", orders.len() + 1);
        let server_id = orders
            .entry(txn.reference_number().to_string())
            .or_insert(next)
            .clone();
        if let Some(e) = lost {
            return Err(e);
        }
        Ok(CheckoutAck {
            server_id,
            receipt_number: Some(txn.reference_number().to_string()),
        })
    }

    async fn validate_transaction(&self, payload: &TransactionPayload) -> Result<(), ApiError> {
        self.validated
            .lock()
            .unwrap()
            .push(payload.reference_number.clone());
        self.validate_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }

    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<Value, ApiError> {
        self.resolutions.lock().unwrap().push(request.clone());
        let delay = *self.resolve_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.resolve_script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(Value::Null))
    }

    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, ApiError> {
        self.catalog_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.catalog_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.catalog
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_else(|| Ok(CatalogSnapshot {
                products: Vec::new(),
                synced_at: None,
            }))
    }

    async fn list_products(
        &self,
        _search: Option<&str>,
        _category_id: Option<&str>,
    ) -> Result<Vec<CatalogProduct>, ApiError> {
        self.listing_fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.listing_delay.lock().unwrap();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.listing.lock().unwrap().clone().unwrap_or(Ok(Vec::new()))
    }

    async fn fetch_image(&self, url: &str) -> Result<ImageBlob, ApiError> {
        self.images
            .lock()
            .unwrap()
            .get(url)
            .cloned()
            .unwrap_or_else(|| Err(ApiError::Server {
                status: 404,
                message: format!("Image download failed for {url}"),
            }))
    }

    async fn health(&self) -> Result<Duration, ApiError> {
        if self.health_down.load(Ordering::SeqCst) {
            Err(network_down())
        } else {
            Ok(Duration::from_millis(12))
        }
    }
}
