//! Local SQLite database layer.
//!
//! Uses rusqlite with WAL mode so the foreground store and the background
//! sync loop can each hold their own connection to the same file. Provides
//! schema migrations and the `local_settings` key/value helpers used for
//! sync metadata and per-deployment configuration.

use rusqlite::{params, Connection};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{error, info, warn};

use crate::error::{Result, SyncError};

/// Shared handle to one database connection.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
}

impl DbState {
    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| SyncError::LockPoisoned)
    }

    /// In-memory database with all migrations applied.
    pub fn in_memory() -> Result<DbState> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(DbState {
            conn: Mutex::new(conn),
            db_path: PathBuf::from(":memory:"),
        })
    }
}

/// Current schema version. Bump when adding new migrations.
const CURRENT_SCHEMA_VERSION: i32 = 2;

pub const DB_FILE_NAME: &str = "pos-offline.db";

/// Initialize the database at `{data_dir}/pos-offline.db`.
///
/// Creates the directory if needed, opens the connection, sets pragmas,
/// and runs any pending migrations. If the file cannot be opened at all it
/// is moved aside (never deleted: it may hold unsynced sales) and a fresh
/// database is created.
pub fn init(data_dir: &Path) -> Result<DbState> {
    fs::create_dir_all(data_dir)?;

    let db_path = data_dir.join(DB_FILE_NAME);
    info!("Opening database at {}", db_path.display());

    let conn = match open_and_configure(&db_path) {
        Ok(c) => c,
        Err(first_err) => {
            warn!(
                "Database open failed ({}), moving it aside and retrying once",
                first_err
            );
            if db_path.exists() {
                let quarantine =
                    db_path.with_extension(format!("corrupt-{}", chrono::Utc::now().timestamp()));
                fs::rename(&db_path, &quarantine)?;
                warn!("Corrupt database preserved at {}", quarantine.display());
            }
            open_and_configure(&db_path)?
        }
    };

    run_migrations(&conn)?;

    info!("Database initialized (schema v{CURRENT_SCHEMA_VERSION})");

    Ok(DbState {
        conn: Mutex::new(conn),
        db_path,
    })
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;

    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;

    Ok(conn)
}

/// Run all pending migrations up to `CURRENT_SCHEMA_VERSION`.
pub(crate) fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )?;

    let current: i32 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )
        .unwrap_or(0);

    if current >= CURRENT_SCHEMA_VERSION {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{CURRENT_SCHEMA_VERSION}");

    if current < 1 {
        migrate_v1(conn)?;
    }
    if current < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

/// Migration v1: settings and the offline transaction queue.
fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        -- local_settings (category/key/value store)
        CREATE TABLE IF NOT EXISTS local_settings (
            id TEXT PRIMARY KEY DEFAULT (lower(hex(randomblob(16)))),
            setting_category TEXT NOT NULL,
            setting_key TEXT NOT NULL,
            setting_value TEXT NOT NULL,
            created_at TEXT DEFAULT (datetime('now')),
            updated_at TEXT DEFAULT (datetime('now')),
            UNIQUE(setting_category, setting_key)
        );

        -- queued_transactions (one row per sale captured on this device)
        CREATE TABLE IF NOT EXISTS queued_transactions (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            local_id TEXT UNIQUE NOT NULL,
            reference_number TEXT UNIQUE NOT NULL,
            server_id TEXT,
            status TEXT NOT NULL DEFAULT 'pending'
                CHECK (status IN ('pending', 'syncing', 'synced', 'failed', 'conflict')),
            payload TEXT NOT NULL,
            server_snapshot TEXT,
            retry_count INTEGER NOT NULL DEFAULT 0,
            last_error TEXT,
            failure_kind TEXT CHECK (failure_kind IS NULL OR failure_kind IN ('validation', 'permanent')),
            next_retry_at INTEGER,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL,
            resolution TEXT CHECK (resolution IS NULL OR resolution IN ('local', 'server')),
            CHECK (status != 'synced' OR server_id IS NOT NULL),
            CHECK (status != 'conflict' OR server_snapshot IS NOT NULL)
        );

        CREATE INDEX IF NOT EXISTS idx_queued_transactions_status ON queued_transactions(status);
        CREATE INDEX IF NOT EXISTS idx_queued_transactions_drain
            ON queued_transactions(status, next_retry_at, created_at);
        CREATE INDEX IF NOT EXISTS idx_local_settings_cat_key ON local_settings(setting_category, setting_key);

        INSERT INTO schema_version (version) VALUES (1);
        ",
    )
    .map_err(|e| {
        error!("Migration v1 failed: {e}");
        SyncError::from(e)
    })?;

    info!("Applied migration v1");
    Ok(())
}

/// Migration v2: product catalog cache.
fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS cached_products (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            sku TEXT,
            unit_price REAL NOT NULL DEFAULT 0,
            marked_price REAL,
            current_stock REAL NOT NULL DEFAULT 0,
            unit TEXT,
            category TEXT,
            category_id TEXT,
            image_url TEXT,
            barcode TEXT,
            has_local_image INTEGER NOT NULL DEFAULT 0,
            last_synced_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_categories (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            product_count INTEGER NOT NULL DEFAULT 0,
            updated_at INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS cached_images (
            product_id TEXT PRIMARY KEY,
            mime_type TEXT NOT NULL,
            data BLOB NOT NULL,
            cached_at INTEGER NOT NULL,
            FOREIGN KEY(product_id) REFERENCES cached_products(id) ON DELETE CASCADE
        );

        CREATE INDEX IF NOT EXISTS idx_cached_products_category_id ON cached_products(category_id);
        CREATE INDEX IF NOT EXISTS idx_cached_products_name ON cached_products(name);

        INSERT INTO schema_version (version) VALUES (2);
        ",
    )
    .map_err(|e| {
        error!("Migration v2 failed: {e}");
        SyncError::from(e)
    })?;

    info!("Applied migration v2 (catalog cache)");
    Ok(())
}

// ---------------------------------------------------------------------------
// Settings helpers
// ---------------------------------------------------------------------------

/// Get a single setting value.
pub fn get_setting(conn: &Connection, category: &str, key: &str) -> Option<String> {
    conn.query_row(
        "SELECT setting_value FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
        |row| row.get(0),
    )
    .ok()
}

/// Insert or update a setting.
pub fn set_setting(conn: &Connection, category: &str, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO local_settings (setting_category, setting_key, setting_value, updated_at)
         VALUES (?1, ?2, ?3, datetime('now'))
         ON CONFLICT(setting_category, setting_key) DO UPDATE SET
            setting_value = excluded.setting_value,
            updated_at = excluded.updated_at",
        params![category, key, value],
    )?;
    Ok(())
}

pub fn delete_setting(conn: &Connection, category: &str, key: &str) -> Result<()> {
    conn.execute(
        "DELETE FROM local_settings WHERE setting_category = ?1 AND setting_key = ?2",
        params![category, key],
    )?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
        .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    #[test]
    fn test_migrations_create_tables() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "cached_categories",
            "cached_images",
            "cached_products",
            "local_settings",
            "queued_transactions",
            "schema_version",
        ] {
            assert!(
                tables.contains(&expected.to_string()),
                "missing table {expected}"
            );
        }

        let version: i32 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(version, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run");

        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, CURRENT_SCHEMA_VERSION);
    }

    #[test]
    fn test_queue_check_constraints() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        // synced without a server id is rejected
        let bad_synced = conn.execute(
            "INSERT INTO queued_transactions (local_id, reference_number, status, payload, created_at, updated_at)
             VALUES ('txn-1', 'RCP-1', 'synced', '{}', 1, 1)",
            [],
        );
        assert!(bad_synced.is_err(), "synced requires server_id");

        // conflict without a server snapshot is rejected
        let bad_conflict = conn.execute(
            "INSERT INTO queued_transactions (local_id, reference_number, status, payload, created_at, updated_at)
             VALUES ('txn-2', 'RCP-2', 'conflict', '{}', 1, 1)",
            [],
        );
        assert!(bad_conflict.is_err(), "conflict requires server_snapshot");

        let bad_status = conn.execute(
            "INSERT INTO queued_transactions (local_id, reference_number, status, payload, created_at, updated_at)
             VALUES ('txn-3', 'RCP-3', 'queued_remote', '{}', 1, 1)",
            [],
        );
        assert!(bad_status.is_err(), "unknown status should be rejected");

        conn.execute(
            "INSERT INTO queued_transactions (local_id, reference_number, payload, created_at, updated_at)
             VALUES ('txn-4', 'RCP-4', '{}', 1, 1)",
            [],
        )
        .expect("pending insert");

        let dup_reference = conn.execute(
            "INSERT INTO queued_transactions (local_id, reference_number, payload, created_at, updated_at)
             VALUES ('txn-5', 'RCP-4', '{}', 1, 1)",
            [],
        );
        assert!(dup_reference.is_err(), "reference numbers are unique");
    }

    #[test]
    fn test_image_rows_cascade_with_product() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        conn.execute(
            "INSERT INTO cached_products (id, name, last_synced_at) VALUES ('p-1', 'Milk', 1)",
            [],
        )
        .unwrap();
        conn.execute(
            "INSERT INTO cached_images (product_id, mime_type, data, cached_at)
             VALUES ('p-1', 'image/png', x'89504E47', 1)",
            [],
        )
        .unwrap();
        conn.execute("DELETE FROM cached_products WHERE id = 'p-1'", [])
            .unwrap();

        let images: i64 = conn
            .query_row("SELECT COUNT(*) FROM cached_images", [], |row| row.get(0))
            .unwrap();
        assert_eq!(images, 0);
    }

    #[test]
    fn test_settings_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_setting(&conn, "sync", "max_retries", "5").expect("set");
        assert_eq!(
            get_setting(&conn, "sync", "max_retries"),
            Some("5".to_string())
        );

        set_setting(&conn, "sync", "max_retries", "4").expect("update");
        assert_eq!(
            get_setting(&conn, "sync", "max_retries"),
            Some("4".to_string())
        );

        delete_setting(&conn, "sync", "max_retries").expect("delete");
        assert!(get_setting(&conn, "sync", "max_retries").is_none());
    }

    #[test]
    fn test_init_creates_database_file() {
        let dir = std::env::temp_dir().join(format!("pos-offline-db-{}", uuid::Uuid::new_v4()));
        let state = init(&dir).expect("init");
        assert!(state.db_path.exists());
        drop(state);

        // Reopening an existing file keeps the schema.
        let again = init(&dir).expect("reopen");
        let conn = again.lock().unwrap();
        set_setting(&conn, "catalog", "last_sync_at", "1").unwrap();
        drop(conn);
        drop(again);
        let _ = fs::remove_dir_all(&dir);
    }
}
