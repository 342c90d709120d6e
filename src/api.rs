//! Admin dashboard API client.
//!
//! The sync engine talks to the server only through the [`PosApi`] trait:
//! checkout submission, pre-flight validation, conflict resolution, bulk
//! catalog download, image download and a health probe. [`HttpPosApi`] is
//! the reqwest implementation; tests drive the engine with an in-memory fake.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ApiError;
use crate::models::{ConflictChoice, QueuedTransaction, TransactionPayload};
use crate::storage::Credentials;

/// Timeout used specifically for the lightweight connectivity probe.
const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

const CHECKOUT_PATH: &str = "/api/pos/checkout";
const VALIDATE_PATH: &str = "/api/pos/validate-transaction";
const RESOLVE_PATH: &str = "/api/pos/resolve-conflict";
const CATALOG_PATH: &str = "/api/pos/products/sync";
const PRODUCTS_PATH: &str = "/api/pos/products";
const HEALTH_PATH: &str = "/api/health";

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

/// Identifiers the server assigned to an accepted checkout.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckoutAck {
    pub server_id: String,
    pub receipt_number: Option<String>,
}

/// One product as returned by `GET products/sync`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogProduct {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub unit_price: f64,
    #[serde(default)]
    pub marked_price: Option<f64>,
    #[serde(default)]
    pub current_stock: f64,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub category_id: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub barcode: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub products: Vec<CatalogProduct>,
    #[serde(default)]
    pub synced_at: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ImageBlob {
    pub mime_type: String,
    pub data: Vec<u8>,
}

/// Body of `POST resolve-conflict`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolveRequest {
    pub transaction_id: String,
    pub resolution: ConflictChoice,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub local_data: Option<Value>,
}

// ---------------------------------------------------------------------------
// Trait seam
// ---------------------------------------------------------------------------

#[async_trait]
pub trait PosApi: Send + Sync {
    /// Submit a queued sale. The reference number is the idempotency key:
    /// resubmitting the same transaction never creates a second order.
    async fn checkout(&self, txn: &QueuedTransaction) -> Result<CheckoutAck, ApiError>;

    /// Pre-flight stock/existence check. `Err(ApiError::Validation)` is a
    /// definite rejection; any other error means the check was inconclusive.
    async fn validate_transaction(&self, payload: &TransactionPayload) -> Result<(), ApiError>;

    /// Apply a human conflict decision server-side. Returns the server's
    /// record after the resolution (may be `Value::Null`).
    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<Value, ApiError>;

    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, ApiError>;

    /// Direct network product listing, used by the read path on a cache miss.
    async fn list_products(
        &self,
        search: Option<&str>,
        category_id: Option<&str>,
    ) -> Result<Vec<CatalogProduct>, ApiError>;

    async fn fetch_image(&self, url: &str) -> Result<ImageBlob, ApiError>;

    /// Round-trip latency of the health endpoint.
    async fn health(&self) -> Result<Duration, ApiError>;
}

// ---------------------------------------------------------------------------
// URL normalisation
// ---------------------------------------------------------------------------

/// Normalise the admin dashboard URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes and a trailing `/api` segment
pub fn normalize_admin_url(url: &str) -> String {
    let mut url = url.trim().to_string();

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    let trimmed = url.trim_end_matches('/');
    let trimmed = trimmed.strip_suffix("/api").unwrap_or(trimmed);
    trimmed.trim_end_matches('/').to_string()
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a user-friendly network error.
fn friendly_error(url: &str, err: &reqwest::Error) -> ApiError {
    let message = if err.is_connect() {
        format!("Cannot reach admin dashboard at {url}")
    } else if err.is_timeout() {
        format!("Connection to {url} timed out")
    } else if err.is_builder() {
        format!("Invalid admin dashboard URL: {url}")
    } else {
        format!("Network error communicating with {url}: {err}")
    };
    ApiError::Network(message)
}

/// Fallback message for a status code when the body carries none.
fn status_error(status: StatusCode) -> String {
    match status.as_u16() {
        401 => "API key is invalid or expired".to_string(),
        403 => "Terminal not authorized".to_string(),
        404 => "Admin dashboard endpoint not found".to_string(),
        409 => "Transaction conflict detected".to_string(),
        s if s >= 500 => "Admin dashboard server error".to_string(),
        _ => "Unexpected response from admin dashboard".to_string(),
    }
}

fn body_message(body: &Value) -> Option<String> {
    body.get("error")
        .or_else(|| body.get("message"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

fn looks_like_stock_error(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("insufficient stock")
        || lower.contains("out of stock")
        || lower.contains("product not found")
}

/// Map a non-success response onto the error taxonomy.
pub(crate) fn classify_response(status: StatusCode, body_text: &str) -> ApiError {
    let body = serde_json::from_str::<Value>(body_text).ok();
    let message = body
        .as_ref()
        .and_then(body_message)
        .unwrap_or_else(|| status_error(status));

    match status.as_u16() {
        409 => {
            let snapshot = body
                .as_ref()
                .and_then(|b| b.get("conflictData").or_else(|| b.get("serverData")))
                .cloned()
                .or(body)
                .unwrap_or(Value::Null);
            ApiError::Conflict {
                message,
                server_snapshot: snapshot,
            }
        }
        400 | 422 => ApiError::Validation {
            invalid_items: invalid_items(body.as_ref()),
            message,
        },
        // A bare 404 is a missing route, a JSON 404 is a missing product.
        404 if body.as_ref().and_then(body_message).is_some() => ApiError::Validation {
            invalid_items: invalid_items(body.as_ref()),
            message,
        },
        s if s < 500 && looks_like_stock_error(&message) => ApiError::Validation {
            invalid_items: invalid_items(body.as_ref()),
            message,
        },
        s => ApiError::Server { status: s, message },
    }
}

fn invalid_items(body: Option<&Value>) -> Vec<String> {
    body.and_then(|b| b.get("invalidItems"))
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|v| match v {
                    Value::String(s) => Some(s.clone()),
                    other => other
                        .get("productId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Pull the canonical server id out of a successful checkout response.
pub(crate) fn extract_checkout_ack(body: &Value) -> Option<CheckoutAck> {
    let nested_id = |key: &str| {
        body.get(key)
            .and_then(|v| v.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    };
    let receipt_number = body
        .get("receiptNumber")
        .or_else(|| body.get("invoiceNumber"))
        .and_then(Value::as_str)
        .map(str::to_string);

    let server_id = nested_id("transaction")
        .or_else(|| nested_id("invoice"))
        .or_else(|| nested_id("order"))
        .or_else(|| receipt_number.clone())?;

    Some(CheckoutAck {
        server_id,
        receipt_number,
    })
}

/// Checkout body: the queued payload plus the client identity fields the
/// server uses to deduplicate resubmissions.
pub(crate) fn checkout_body(txn: &QueuedTransaction) -> Result<Value, ApiError> {
    let mut body = serde_json::to_value(&txn.payload)
        .map_err(|e| ApiError::InvalidResponse(format!("Unserializable payload: {e}")))?;
    if let Value::Object(map) = &mut body {
        map.insert("localId".into(), Value::String(txn.local_id.clone()));
        map.insert(
            "clientReference".into(),
            Value::String(txn.payload.reference_number.clone()),
        );
        map.insert(
            "timestamp".into(),
            Value::from(txn.created_at.timestamp_millis()),
        );
    }
    Ok(body)
}

fn mime_from_url(url: &str) -> &'static str {
    let path = url.split(['?', '#']).next().unwrap_or(url).to_ascii_lowercase();
    if path.ends_with(".png") {
        "image/png"
    } else if path.ends_with(".webp") {
        "image/webp"
    } else if path.ends_with(".gif") {
        "image/gif"
    } else if path.ends_with(".svg") {
        "image/svg+xml"
    } else {
        "image/jpeg"
    }
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

pub struct HttpPosApi {
    client: Client,
    base_url: String,
    api_key: String,
    terminal_id: String,
}

impl HttpPosApi {
    pub fn new(credentials: &Credentials, timeout: Duration) -> Result<Self, ApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ApiError::Network(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: normalize_admin_url(&credentials.admin_url),
            api_key: credentials.api_key.clone(),
            terminal_id: credentials.terminal_id.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: reqwest::Method, url: &str) -> reqwest::RequestBuilder {
        self.client
            .request(method, url)
            .header("X-POS-API-Key", &self.api_key)
            .header("x-terminal-id", &self.terminal_id)
    }

    /// Send and return the JSON body, or `Value::Null` for an empty success.
    async fn send_json(&self, req: reqwest::RequestBuilder) -> Result<Value, ApiError> {
        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        let body_text = resp
            .text()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;

        if !status.is_success() {
            let err = classify_response(status, &body_text);
            debug!(status = status.as_u16(), error = %err, "admin request rejected");
            return Err(err);
        }
        if body_text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&body_text)
            .map_err(|e| ApiError::InvalidResponse(format!("Invalid JSON from admin dashboard: {e}")))
    }
}

#[async_trait]
impl PosApi for HttpPosApi {
    async fn checkout(&self, txn: &QueuedTransaction) -> Result<CheckoutAck, ApiError> {
        let body = checkout_body(txn)?;
        let req = self
            .request(reqwest::Method::POST, &self.url(CHECKOUT_PATH))
            .header("Idempotency-Key", txn.reference_number())
            .json(&body);
        let data = self.send_json(req).await?;
        extract_checkout_ack(&data).ok_or_else(|| {
            ApiError::InvalidResponse("checkout response carries no transaction id".into())
        })
    }

    async fn validate_transaction(&self, payload: &TransactionPayload) -> Result<(), ApiError> {
        let req = self
            .request(reqwest::Method::POST, &self.url(VALIDATE_PATH))
            .json(&serde_json::json!({ "items": payload.items }));
        match self.send_json(req).await {
            Ok(_) => Ok(()),
            // Any 4xx from the validator is a rejection of the items.
            Err(ApiError::Server { status, message })
                if (400..500).contains(&status) && status != 401 && status != 403 =>
            {
                Err(ApiError::Validation {
                    message,
                    invalid_items: Vec::new(),
                })
            }
            Err(e) => Err(e),
        }
    }

    async fn resolve_conflict(&self, request: &ResolveRequest) -> Result<Value, ApiError> {
        let req = self
            .request(reqwest::Method::POST, &self.url(RESOLVE_PATH))
            .json(request);
        let data = self.send_json(req).await?;
        info!(
            transaction_id = %request.transaction_id,
            resolution = request.resolution.as_str(),
            "conflict resolution accepted by server"
        );
        Ok(data.get("transaction").cloned().unwrap_or(Value::Null))
    }

    async fn fetch_catalog(&self) -> Result<CatalogSnapshot, ApiError> {
        let req = self.request(reqwest::Method::GET, &self.url(CATALOG_PATH));
        let data = self.send_json(req).await?;
        serde_json::from_value(data)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed catalog: {e}")))
    }

    async fn list_products(
        &self,
        search: Option<&str>,
        category_id: Option<&str>,
    ) -> Result<Vec<CatalogProduct>, ApiError> {
        let mut query: Vec<(&str, &str)> = Vec::new();
        if let Some(s) = search.filter(|s| !s.is_empty()) {
            query.push(("search", s));
        }
        if let Some(c) = category_id.filter(|c| !c.is_empty()) {
            query.push(("categoryId", c));
        }
        let req = self
            .request(reqwest::Method::GET, &self.url(PRODUCTS_PATH))
            .query(&query);
        let data = self.send_json(req).await?;
        let products = data.get("products").cloned().unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(products)
            .map_err(|e| ApiError::InvalidResponse(format!("Malformed product list: {e}")))
    }

    async fn fetch_image(&self, url: &str) -> Result<ImageBlob, ApiError> {
        let full_url = if url.starts_with("http://") || url.starts_with("https://") {
            url.to_string()
        } else {
            self.url(&format!("/{}", url.trim_start_matches('/')))
        };
        let resp = self
            .client
            .get(&full_url)
            .send()
            .await
            .map_err(|e| friendly_error(&full_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: format!("Image download failed for {full_url}"),
            });
        }
        let mime_type = resp
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .filter(|v| v.starts_with("image/"))
            .map(|v| v.split(';').next().unwrap_or(v).trim().to_string())
            .unwrap_or_else(|| mime_from_url(&full_url).to_string());
        let data = resp
            .bytes()
            .await
            .map_err(|e| friendly_error(&full_url, &e))?;
        Ok(ImageBlob {
            mime_type,
            data: data.to_vec(),
        })
    }

    async fn health(&self) -> Result<Duration, ApiError> {
        let start = Instant::now();
        let resp = self
            .request(reqwest::Method::GET, &self.url(HEALTH_PATH))
            .timeout(CONNECTIVITY_TIMEOUT)
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            warn!(status = status.as_u16(), "health probe rejected");
            return Err(ApiError::Server {
                status: status.as_u16(),
                message: status_error(status),
            });
        }
        Ok(start.elapsed())
    }
}
