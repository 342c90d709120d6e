//! Local product catalog cache: products, derived categories and image
//! blobs, plus the last-sync timestamp.
//!
//! Products are overwritten whole on every sync, never merged field by
//! field. Images hang off their product with `ON DELETE CASCADE`, so
//! removing a product (or clearing the cache) removes its image too.

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info};

use crate::api::CatalogProduct;
use crate::db::{self, DbState};
use crate::error::{Result, SyncError};
use crate::models::{
    ms_to_datetime, now_ms, CacheStats, CachedCategory, CachedImage, CachedProduct,
};

pub const SETTINGS_CATEGORY: &str = "catalog";
const KEY_LAST_SYNC_AT: &str = "last_sync_at";

/// Category ids synthesised for products that only carry a category name.
pub const LEGACY_CATEGORY_PREFIX: &str = "legacy_";

const PRODUCT_COLUMNS: &str = "id, name, sku, unit_price, marked_price, current_stock, unit,
     category, category_id, image_url, barcode, has_local_image, last_synced_at";

fn read_product(row: &Row<'_>) -> rusqlite::Result<CachedProduct> {
    Ok(CachedProduct {
        id: row.get(0)?,
        name: row.get(1)?,
        sku: row.get(2)?,
        unit_price: row.get(3)?,
        marked_price: row.get(4)?,
        current_stock: row.get(5)?,
        unit: row.get(6)?,
        category: row.get(7)?,
        category_id: row.get(8)?,
        image_url: row.get(9)?,
        barcode: row.get(10)?,
        has_local_image: row.get::<_, i64>(11)? != 0,
        last_synced_at: ms_to_datetime(row.get(12)?),
    })
}

/// Filter for cached product reads.
#[derive(Debug, Clone, Default)]
pub struct ProductQuery {
    /// Case-insensitive match on name, SKU or barcode.
    pub search: Option<String>,
    /// A real category id, or `legacy_<name>` to match by category name.
    pub category_id: Option<String>,
}

// ---------------------------------------------------------------------------
// Writes
// ---------------------------------------------------------------------------

/// Upsert one product, dropping its cached image when the image URL moved.
fn upsert_product(conn: &Connection, product: &CatalogProduct, synced_at: i64) -> Result<()> {
    let previous_url: Option<Option<String>> = conn
        .query_row(
            "SELECT image_url FROM cached_products WHERE id = ?1",
            params![product.id],
            |row| row.get(0),
        )
        .optional()?;
    let image_moved = matches!(&previous_url, Some(prev) if *prev != product.image_url);
    if image_moved {
        conn.execute(
            "DELETE FROM cached_images WHERE product_id = ?1",
            params![product.id],
        )?;
    }

    conn.execute(
        "INSERT INTO cached_products (
             id, name, sku, unit_price, marked_price, current_stock, unit,
             category, category_id, image_url, barcode, has_local_image, last_synced_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 0, ?12)
         ON CONFLICT(id) DO UPDATE SET
             name = excluded.name,
             sku = excluded.sku,
             unit_price = excluded.unit_price,
             marked_price = excluded.marked_price,
             current_stock = excluded.current_stock,
             unit = excluded.unit,
             category = excluded.category,
             category_id = excluded.category_id,
             image_url = excluded.image_url,
             barcode = excluded.barcode,
             has_local_image = EXISTS (SELECT 1 FROM cached_images WHERE product_id = excluded.id),
             last_synced_at = excluded.last_synced_at",
        params![
            product.id,
            product.name,
            product.sku,
            product.unit_price,
            product.marked_price,
            product.current_stock,
            product.unit,
            product.category,
            product.category_id,
            product.image_url,
            product.barcode,
            synced_at,
        ],
    )?;
    Ok(())
}

/// Rebuild `cached_categories` from the cached products.
fn refresh_categories(conn: &Connection, updated_at: i64) -> Result<usize> {
    let mut stmt = conn.prepare("SELECT category_id, category FROM cached_products")?;
    let rows = stmt
        .query_map([], |row| {
            Ok((row.get::<_, Option<String>>(0)?, row.get::<_, Option<String>>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut categories: BTreeMap<String, (String, u32)> = BTreeMap::new();
    for (id, name) in rows {
        let id = id.filter(|s| !s.trim().is_empty());
        let name = name.filter(|s| !s.trim().is_empty());
        let (key, label) = match (id, name) {
            (Some(id), Some(name)) => (id, name),
            (Some(id), None) => (id.clone(), id),
            (None, Some(name)) => (format!("{LEGACY_CATEGORY_PREFIX}{name}"), name),
            (None, None) => continue,
        };
        categories.entry(key).or_insert((label, 0)).1 += 1;
    }

    conn.execute("DELETE FROM cached_categories", [])?;
    let mut insert = conn.prepare(
        "INSERT INTO cached_categories (id, name, product_count, updated_at) VALUES (?1, ?2, ?3, ?4)",
    )?;
    for (id, (name, count)) in &categories {
        insert.execute(params![id, name, count, updated_at])?;
    }
    Ok(categories.len())
}

/// Upsert `products` without touching products absent from the list.
pub fn upsert_products(db: &DbState, products: &[CatalogProduct]) -> Result<usize> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let now = now_ms();
    for product in products {
        upsert_product(&tx, product, now)?;
    }
    refresh_categories(&tx, now)?;
    tx.commit()?;
    Ok(products.len())
}

/// Make the cache mirror `products` exactly: upsert every listed product
/// and delete the rest (their images cascade). One SQLite transaction.
pub fn replace_catalog(db: &DbState, products: &[CatalogProduct]) -> Result<usize> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let now = now_ms();

    let keep: HashSet<&str> = products.iter().map(|p| p.id.as_str()).collect();
    let existing: Vec<String> = tx
        .prepare("SELECT id FROM cached_products")?
        .query_map([], |row| row.get(0))?
        .collect::<rusqlite::Result<_>>()?;
    let mut removed = 0;
    for id in existing.iter().filter(|id| !keep.contains(id.as_str())) {
        removed += tx.execute("DELETE FROM cached_products WHERE id = ?1", params![id])?;
    }

    for product in products {
        upsert_product(&tx, product, now)?;
    }
    let categories = refresh_categories(&tx, now)?;
    tx.commit()?;

    info!(
        products = products.len(),
        removed,
        categories,
        "catalog cache replaced"
    );
    Ok(products.len())
}

/// Store (or replace) the image for `product_id` and flag the product.
pub fn upsert_image(db: &DbState, product_id: &str, mime_type: &str, data: &[u8]) -> Result<()> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    let flagged = tx.execute(
        "UPDATE cached_products SET has_local_image = 1 WHERE id = ?1",
        params![product_id],
    )?;
    if flagged == 0 {
        return Err(SyncError::NotFound(format!("product {product_id}")));
    }
    tx.execute(
        "INSERT INTO cached_images (product_id, mime_type, data, cached_at)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(product_id) DO UPDATE SET
             mime_type = excluded.mime_type,
             data = excluded.data,
             cached_at = excluded.cached_at",
        params![product_id, mime_type, data, now_ms()],
    )?;
    tx.commit()?;
    debug!(product_id, bytes = data.len(), "image cached");
    Ok(())
}

/// Wipe products, categories, images and the last-sync marker.
pub fn clear(db: &DbState) -> Result<()> {
    let mut conn = db.lock()?;
    let tx = conn.transaction()?;
    tx.execute("DELETE FROM cached_images", [])?;
    tx.execute("DELETE FROM cached_products", [])?;
    tx.execute("DELETE FROM cached_categories", [])?;
    db::delete_setting(&tx, SETTINGS_CATEGORY, KEY_LAST_SYNC_AT)?;
    tx.commit()?;
    info!("catalog cache cleared");
    Ok(())
}

pub fn set_last_sync_time(db: &DbState, at_ms: i64) -> Result<()> {
    let conn = db.lock()?;
    db::set_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_SYNC_AT, &at_ms.to_string())
}

// ---------------------------------------------------------------------------
// Reads
// ---------------------------------------------------------------------------

pub fn last_sync_time(db: &DbState) -> Result<Option<chrono::DateTime<chrono::Utc>>> {
    let conn = db.lock()?;
    Ok(db::get_setting(&conn, SETTINGS_CATEGORY, KEY_LAST_SYNC_AT)
        .and_then(|v| v.parse::<i64>().ok())
        .map(ms_to_datetime))
}

pub fn has_cached_data(db: &DbState) -> Result<bool> {
    let conn = db.lock()?;
    let exists: bool = conn.query_row(
        "SELECT EXISTS (SELECT 1 FROM cached_products)",
        [],
        |row| row.get(0),
    )?;
    Ok(exists)
}

pub fn stats(db: &DbState) -> Result<CacheStats> {
    let conn = db.lock()?;
    let count = |table: &str| -> Result<u64> {
        let n: i64 =
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))?;
        Ok(n.max(0) as u64)
    };
    Ok(CacheStats {
        products_count: count("cached_products")?,
        categories_count: count("cached_categories")?,
        images_count: count("cached_images")?,
    })
}

pub fn get_product(db: &DbState, id: &str) -> Result<Option<CachedProduct>> {
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            &format!("SELECT {PRODUCT_COLUMNS} FROM cached_products WHERE id = ?1"),
            params![id],
            read_product,
        )
        .optional()?)
}

/// Cached products matching `query`, in-stock first, then by name.
pub fn get_products(db: &DbState, query: &ProductQuery) -> Result<Vec<CachedProduct>> {
    let mut sql = format!("SELECT {PRODUCT_COLUMNS} FROM cached_products WHERE 1 = 1");
    let mut args: Vec<String> = Vec::new();

    if let Some(category_id) = query.category_id.as_deref().filter(|c| !c.is_empty()) {
        match category_id.strip_prefix(LEGACY_CATEGORY_PREFIX) {
            Some(name) => {
                args.push(name.to_string());
                sql.push_str(&format!(" AND category = ?{}", args.len()));
            }
            None => {
                args.push(category_id.to_string());
                sql.push_str(&format!(" AND category_id = ?{}", args.len()));
            }
        }
    }
    if let Some(search) = query.search.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        args.push(format!("%{}%", search.to_lowercase()));
        let n = args.len();
        sql.push_str(&format!(
            " AND (lower(name) LIKE ?{n} OR lower(COALESCE(sku, '')) LIKE ?{n}
                   OR lower(COALESCE(barcode, '')) LIKE ?{n})"
        ));
    }
    sql.push_str(" ORDER BY (current_stock > 0) DESC, name COLLATE NOCASE ASC, id ASC");

    let conn = db.lock()?;
    let mut stmt = conn.prepare(&sql)?;
    let products = stmt
        .query_map(rusqlite::params_from_iter(args.iter()), read_product)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(products)
}

pub fn get_categories(db: &DbState) -> Result<Vec<CachedCategory>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, name, product_count, updated_at FROM cached_categories
         ORDER BY name COLLATE NOCASE ASC",
    )?;
    let categories = stmt
        .query_map([], |row| {
            Ok(CachedCategory {
                id: row.get(0)?,
                name: row.get(1)?,
                product_count: row.get::<_, i64>(2)?.max(0) as u32,
                updated_at: ms_to_datetime(row.get(3)?),
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(categories)
}

pub fn get_image(db: &DbState, product_id: &str) -> Result<Option<CachedImage>> {
    let conn = db.lock()?;
    Ok(conn
        .query_row(
            "SELECT product_id, mime_type, data, cached_at FROM cached_images WHERE product_id = ?1",
            params![product_id],
            |row| {
                Ok(CachedImage {
                    product_id: row.get(0)?,
                    mime_type: row.get(1)?,
                    data: row.get(2)?,
                    cached_at: ms_to_datetime(row.get(3)?),
                })
            },
        )
        .optional()?)
}

/// `product id -> image URL` for every cached product that has one.
pub fn image_sources(db: &DbState) -> Result<HashMap<String, String>> {
    let conn = db.lock()?;
    let mut stmt = conn.prepare(
        "SELECT id, image_url FROM cached_products
         WHERE image_url IS NOT NULL AND image_url != ''",
    )?;
    let sources = stmt
        .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
        .collect::<rusqlite::Result<HashMap<String, String>>>()?;
    Ok(sources)
}
