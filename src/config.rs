//! Deployment configuration for the sync engine.
//!
//! Layered: built-in defaults, then rows in `local_settings` under the
//! `sync` category, then `POS_SYNC_*` environment variables.

use std::time::Duration;
use tracing::warn;

use crate::db::{self, DbState};
use crate::error::{Result, SyncError};

pub const SETTINGS_CATEGORY: &str = "sync";

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    /// Transient failures allowed before a transaction is permanently failed.
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_max: Duration,
    /// Periodic drain trigger.
    pub drain_interval: Duration,
    pub connectivity_interval: Duration,
    /// A `syncing` record untouched for this long belongs to a dead drain.
    pub stale_syncing_after: Duration,
    /// Parallel image downloads during a catalog sync.
    pub image_concurrency: usize,
    pub request_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base: Duration::from_secs(1),
            backoff_max: Duration::from_secs(60),
            drain_interval: Duration::from_secs(5),
            connectivity_interval: Duration::from_secs(15),
            stale_syncing_after: Duration::from_secs(5 * 60),
            image_concurrency: 5,
            request_timeout: Duration::from_secs(30),
        }
    }
}

/// Setting keys, shared by `local_settings` (as-is) and the environment
/// (upper-cased, prefixed with `POS_SYNC_`).
const KEY_MAX_RETRIES: &str = "max_retries";
const KEY_BACKOFF_BASE_MS: &str = "backoff_base_ms";
const KEY_BACKOFF_MAX_MS: &str = "backoff_max_ms";
const KEY_DRAIN_INTERVAL_SECS: &str = "drain_interval_secs";
const KEY_CONNECTIVITY_INTERVAL_SECS: &str = "connectivity_interval_secs";
const KEY_STALE_SYNCING_SECS: &str = "stale_syncing_secs";
const KEY_IMAGE_CONCURRENCY: &str = "image_concurrency";
const KEY_REQUEST_TIMEOUT_SECS: &str = "request_timeout_secs";

fn env_name(key: &str) -> String {
    format!("POS_SYNC_{}", key.to_ascii_uppercase())
}

fn parse_u64(key: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{key}: expected a non-negative integer, got {raw:?}")))
}

impl SyncConfig {
    /// Delay before retry number `retry_count` (1-based) becomes eligible:
    /// `base * 2^(retry_count - 1)`, capped at `backoff_max`.
    pub fn backoff_for(&self, retry_count: u32) -> Duration {
        let exponent = retry_count.saturating_sub(1).min(20);
        self.backoff_base
            .saturating_mul(1u32 << exponent)
            .min(self.backoff_max)
    }

    /// Overlay one `key = value` pair.
    fn apply(&mut self, key: &str, raw: &str) -> Result<()> {
        match key {
            KEY_MAX_RETRIES => {
                self.max_retries = u32::try_from(parse_u64(key, raw)?)
                    .map_err(|_| SyncError::Config(format!("{key}: out of range")))?;
            }
            KEY_BACKOFF_BASE_MS => self.backoff_base = Duration::from_millis(parse_u64(key, raw)?),
            KEY_BACKOFF_MAX_MS => self.backoff_max = Duration::from_millis(parse_u64(key, raw)?),
            KEY_DRAIN_INTERVAL_SECS => {
                self.drain_interval = Duration::from_secs(parse_u64(key, raw)?)
            }
            KEY_CONNECTIVITY_INTERVAL_SECS => {
                self.connectivity_interval = Duration::from_secs(parse_u64(key, raw)?)
            }
            KEY_STALE_SYNCING_SECS => {
                self.stale_syncing_after = Duration::from_secs(parse_u64(key, raw)?)
            }
            KEY_IMAGE_CONCURRENCY => self.image_concurrency = parse_u64(key, raw)? as usize,
            KEY_REQUEST_TIMEOUT_SECS => {
                self.request_timeout = Duration::from_secs(parse_u64(key, raw)?)
            }
            other => return Err(SyncError::Config(format!("unknown sync setting: {other}"))),
        }
        Ok(())
    }

    const KEYS: [&'static str; 8] = [
        KEY_MAX_RETRIES,
        KEY_BACKOFF_BASE_MS,
        KEY_BACKOFF_MAX_MS,
        KEY_DRAIN_INTERVAL_SECS,
        KEY_CONNECTIVITY_INTERVAL_SECS,
        KEY_STALE_SYNCING_SECS,
        KEY_IMAGE_CONCURRENCY,
        KEY_REQUEST_TIMEOUT_SECS,
    ];

    /// Overlay values found by `lookup`. Malformed values are logged and
    /// skipped so one bad row cannot keep the daemon from starting.
    fn overlay<F>(mut self, source: &str, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        for key in Self::KEYS {
            if let Some(raw) = lookup(key) {
                if let Err(e) = self.apply(key, &raw) {
                    warn!(source, error = %e, "ignoring sync setting");
                }
            }
        }
        self
    }

    fn validated(mut self) -> Self {
        if self.image_concurrency == 0 {
            self.image_concurrency = 1;
        }
        if self.drain_interval.is_zero() {
            self.drain_interval = Duration::from_secs(1);
        }
        if self.connectivity_interval.is_zero() {
            self.connectivity_interval = Duration::from_secs(1);
        }
        if self.backoff_max < self.backoff_base {
            self.backoff_max = self.backoff_base;
        }
        self
    }

    /// Defaults, then `local_settings`, then the process environment.
    pub fn load(db: &DbState) -> Result<Self> {
        let conn = db.lock()?;
        let config = Self::default()
            .overlay("local_settings", |key| {
                db::get_setting(&conn, SETTINGS_CATEGORY, key)
            })
            .overlay("environment", |key| std::env::var(env_name(key)).ok());
        Ok(config.validated())
    }

    /// Persist one setting for this deployment after checking it parses.
    pub fn save_setting(db: &DbState, key: &str, value: &str) -> Result<()> {
        Self::default().apply(key, value)?;
        let conn = db.lock()?;
        db::set_setting(&conn, SETTINGS_CATEGORY, key, value.trim())
    }
}
