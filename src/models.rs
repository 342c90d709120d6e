//! Domain types shared by the local store, the sync manager and the catalog
//! cache. Wire shapes use camelCase to match the admin dashboard API.

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Timestamps
// ---------------------------------------------------------------------------

/// All persisted timestamps are unix milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or_else(|| DateTime::<Utc>::from(std::time::UNIX_EPOCH))
}

// ---------------------------------------------------------------------------
// Queued transactions
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Conflict,
}

impl TransactionStatus {
    pub const ALL: [TransactionStatus; 5] = [
        TransactionStatus::Pending,
        TransactionStatus::Syncing,
        TransactionStatus::Synced,
        TransactionStatus::Failed,
        TransactionStatus::Conflict,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Syncing => "syncing",
            TransactionStatus::Synced => "synced",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Conflict => "conflict",
        }
    }

    /// Allowed edges of the per-transaction state machine. Updating a record
    /// without changing its status is always allowed except for `synced`.
    pub fn can_transition_to(self, next: TransactionStatus) -> bool {
        use TransactionStatus::*;
        match (self, next) {
            (Synced, _) => false,
            (a, b) if a == b => true,
            (Pending, Syncing) => true,
            (Syncing, Synced | Failed | Conflict | Pending) => true,
            (Failed, Pending) => true,
            (Conflict, Synced) => true,
            _ => false,
        }
    }
}

impl fmt::Display for TransactionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TransactionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pending" => Ok(TransactionStatus::Pending),
            "syncing" => Ok(TransactionStatus::Syncing),
            "synced" => Ok(TransactionStatus::Synced),
            "failed" => Ok(TransactionStatus::Failed),
            "conflict" => Ok(TransactionStatus::Conflict),
            other => Err(format!("unknown transaction status: {other}")),
        }
    }
}

/// Why a transaction sits in `failed`. The UI offers a manual retry for
/// both; neither is retried automatically.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailureKind {
    /// Server rejected the sale (stock, missing product).
    Validation,
    /// Retry budget exhausted or a non-retryable server response.
    Permanent,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Validation => "validation",
            FailureKind::Permanent => "permanent",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "validation" => Some(FailureKind::Validation),
            "permanent" => Some(FailureKind::Permanent),
            _ => None,
        }
    }
}

/// Which side wins when a human adjudicates a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictChoice {
    Local,
    Server,
}

impl ConflictChoice {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictChoice::Local => "local",
            ConflictChoice::Server => "server",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "local" => Some(ConflictChoice::Local),
            "server" => Some(ConflictChoice::Server),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    pub product_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub quantity: f64,
    pub price: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub discount: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Totals {
    pub subtotal: f64,
    #[serde(default)]
    pub tax_amount: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tax_percent: Option<f64>,
    #[serde(default)]
    pub discount: f64,
    pub total: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentBreakdown {
    pub method: String,
    pub amount_paid: f64,
    #[serde(default)]
    pub change_given: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cash_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub card_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upi_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wallet_amount: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerRef {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
}

/// Sale captured at the till. Pricing has already been applied by the
/// checkout UI; the sync engine treats these numbers as opaque.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionPayload {
    pub items: Vec<LineItem>,
    pub totals: Totals,
    pub payment: PaymentBreakdown,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub customer: Option<CustomerRef>,
    /// Client-generated receipt number, doubles as the idempotency key.
    /// Filled in by `queue::enqueue` when empty.
    #[serde(default)]
    pub reference_number: String,
    /// Fields the engine does not interpret (coupon codes, notes, ...).
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl TransactionPayload {
    /// Flat shape accepted by `POST resolve-conflict` as `localData`: it
    /// overwrites amounts, payment and line items of the server record.
    pub fn to_resolution_data(&self) -> Value {
        let customer = self.customer.clone().unwrap_or_default();
        let items: Vec<Value> = self
            .items
            .iter()
            .map(|item| {
                serde_json::json!({
                    "productId": item.product_id,
                    "quantity": item.quantity,
                    "price": item.price,
                    "discount": item.discount.unwrap_or(0.0),
                })
            })
            .collect();
        serde_json::json!({
            "referenceNumber": self.reference_number,
            "customerName": customer.name,
            "customerPhone": customer.phone,
            "paymentMethod": self.payment.method,
            "amountPaid": self.payment.amount_paid,
            "changeGiven": self.payment.change_given,
            "cashAmount": self.payment.cash_amount,
            "cardAmount": self.payment.card_amount,
            "upiAmount": self.payment.upi_amount,
            "walletAmount": self.payment.wallet_amount,
            "billDiscount": self.totals.discount,
            "taxPercent": self.totals.tax_percent,
            "taxAmount": self.totals.tax_amount,
            "subtotal": self.totals.subtotal,
            "totalAmount": self.totals.total,
            "notes": self.payment.notes,
            "items": items,
        })
    }

    /// Overwrite amounts, payment and line items with the server's record,
    /// keeping the reference number. Fields the server omits stay as queued.
    pub fn adopt_server_record(&mut self, record: &Value) {
        let num = |keys: &[&str]| keys.iter().find_map(|k| record.get(*k).and_then(Value::as_f64));
        let text = |keys: &[&str]| {
            keys.iter()
                .find_map(|k| record.get(*k).and_then(Value::as_str))
                .map(str::to_string)
        };

        if let Some(v) = num(&["subtotal"]) {
            self.totals.subtotal = v;
        }
        if let Some(v) = num(&["taxAmount", "tax_amount"]) {
            self.totals.tax_amount = v;
        }
        if let Some(v) = num(&["taxPercent", "tax_percent"]) {
            self.totals.tax_percent = Some(v);
        }
        if let Some(v) = num(&["billDiscount", "discountAmount", "discount"]) {
            self.totals.discount = v;
        }
        if let Some(v) = num(&["totalAmount", "total_amount", "total"]) {
            self.totals.total = v;
        }
        if let Some(v) = text(&["paymentMethod", "payment_method"]) {
            self.payment.method = v;
        }
        if let Some(v) = num(&["amountPaid", "paidAmount", "amount_paid"]) {
            self.payment.amount_paid = v;
        }
        if let Some(v) = num(&["changeGiven", "change_given"]) {
            self.payment.change_given = v;
        }
        if let Some(v) = num(&["cashAmount"]) {
            self.payment.cash_amount = Some(v);
        }
        if let Some(v) = num(&["cardAmount"]) {
            self.payment.card_amount = Some(v);
        }
        if let Some(v) = num(&["upiAmount"]) {
            self.payment.upi_amount = Some(v);
        }
        if let Some(v) = num(&["walletAmount"]) {
            self.payment.wallet_amount = Some(v);
        }

        if let Some(items) = record.get("items").and_then(Value::as_array) {
            let parsed: Vec<LineItem> = items
                .iter()
                .filter_map(|item| {
                    let product_id = item
                        .get("productId")
                        .or_else(|| item.get("product_id"))
                        .and_then(Value::as_str)?;
                    let quantity = item.get("quantity").and_then(Value::as_f64)?;
                    let price = item
                        .get("price")
                        .or_else(|| item.get("unitPrice"))
                        .and_then(Value::as_f64)?;
                    Some(LineItem {
                        product_id: product_id.to_string(),
                        name: item.get("name").and_then(Value::as_str).map(str::to_string),
                        quantity,
                        price,
                        discount: item.get("discount").and_then(Value::as_f64),
                    })
                })
                .collect();
            // Only replace when every server line was understood.
            if parsed.len() == items.len() {
                self.items = parsed;
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueuedTransaction {
    pub local_id: String,
    pub server_id: Option<String>,
    pub status: TransactionStatus,
    pub payload: TransactionPayload,
    /// Last-known server version, retained while in (or after) `conflict`.
    pub server_snapshot: Option<Value>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub failure_kind: Option<FailureKind>,
    /// Not eligible for a drain before this instant (exponential backoff).
    pub next_retry_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once a conflict has been adjudicated.
    pub resolution: Option<ConflictChoice>,
}

impl QueuedTransaction {
    pub fn reference_number(&self) -> &str {
        &self.payload.reference_number
    }
}

/// Partial update applied atomically by `queue::update`. `None` leaves the
/// column untouched; the nested options clear a nullable column.
#[derive(Debug, Clone, Default)]
pub struct TransactionPatch {
    pub status: Option<TransactionStatus>,
    pub server_id: Option<Option<String>>,
    pub payload: Option<TransactionPayload>,
    pub server_snapshot: Option<Option<Value>>,
    pub retry_count: Option<u32>,
    pub last_error: Option<Option<String>>,
    pub failure_kind: Option<Option<FailureKind>>,
    pub next_retry_at: Option<Option<DateTime<Utc>>>,
    pub resolution: Option<Option<ConflictChoice>>,
}

impl TransactionPatch {
    pub fn status(status: TransactionStatus) -> Self {
        Self {
            status: Some(status),
            ..Default::default()
        }
    }
}

// ---------------------------------------------------------------------------
// Catalog cache
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedProduct {
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
    #[serde(default)]
    pub has_local_image: bool,
    #[serde(default = "epoch")]
    pub last_synced_at: DateTime<Utc>,
}

fn epoch() -> DateTime<Utc> {
    ms_to_datetime(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedCategory {
    pub id: String,
    pub name: String,
    pub product_count: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CachedImage {
    pub product_id: String,
    pub mime_type: String,
    pub data: Vec<u8>,
    pub cached_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheStats {
    pub products_count: u64,
    pub categories_count: u64,
    pub images_count: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncPhase {
    #[default]
    Idle,
    Fetching,
    CachingImages,
    Complete,
    Error,
}

/// Progress of the catalog sync, published to observers on every change.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncProgress {
    pub phase: SyncPhase,
    pub total_products: u64,
    pub synced_products: u64,
    pub total_images: u64,
    pub cached_images: u64,
    pub error: Option<String>,
}
