//! Terminal credentials in the OS credential store.
//!
//! On Windows this uses DPAPI (via the `keyring` crate), on macOS Keychain,
//! and on Linux the Secret Service API. Headless deployments without a
//! keyring daemon can supply the same values through `POS_ADMIN_URL`,
//! `POS_API_KEY` and `POS_TERMINAL_ID`.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use keyring::Entry;
use serde::Deserialize;
use tracing::{info, warn};

use crate::api::normalize_admin_url;
use crate::error::{Result, SyncError};

const SERVICE_NAME: &str = "pos-offline-sync";

pub const KEY_ADMIN_URL: &str = "admin_dashboard_url";
pub const KEY_TERMINAL_ID: &str = "terminal_id";
pub const KEY_API_KEY: &str = "pos_api_key";

const ALL_KEYS: &[&str] = &[KEY_ADMIN_URL, KEY_TERMINAL_ID, KEY_API_KEY];

const ENV_ADMIN_URL: &str = "POS_ADMIN_URL";
const ENV_API_KEY: &str = "POS_API_KEY";
const ENV_TERMINAL_ID: &str = "POS_TERMINAL_ID";

/// Everything needed to authenticate against the admin dashboard.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub admin_url: String,
    pub api_key: String,
    pub terminal_id: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("admin_url", &self.admin_url)
            .field("api_key", &"<redacted>")
            .field("terminal_id", &self.terminal_id)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Low-level helpers
// ---------------------------------------------------------------------------

/// Retrieve a single credential from the OS keyring. Returns `None` when the
/// entry does not exist or the platform store is unavailable.
pub fn get_credential(key: &str) -> Option<String> {
    let entry = match Entry::new(SERVICE_NAME, key) {
        Ok(e) => e,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to create entry");
            return None;
        }
    };
    match entry.get_password() {
        Ok(pw) => Some(pw),
        Err(keyring::Error::NoEntry) => None,
        Err(e) => {
            warn!(key, error = %e, "keyring: failed to read credential");
            None
        }
    }
}

pub fn set_credential(key: &str, value: &str) -> Result<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Config(format!("keyring: {e}")))?;
    entry
        .set_password(value)
        .map_err(|e| SyncError::Config(format!("keyring: {e}")))
}

/// Silently succeeds if the entry does not exist.
pub fn delete_credential(key: &str) -> Result<()> {
    let entry =
        Entry::new(SERVICE_NAME, key).map_err(|e| SyncError::Config(format!("keyring: {e}")))?;
    match entry.delete_credential() {
        Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
        Err(e) => Err(SyncError::Config(format!("keyring: {e}"))),
    }
}

// ---------------------------------------------------------------------------
// Connection strings
// ---------------------------------------------------------------------------

/// Onboarding hands terminals a single opaque string: JSON (plain or
/// url-safe base64) with the admin URL, API key and terminal id.
#[derive(Debug, Deserialize)]
struct ConnectionString {
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    key: Option<String>,
    #[serde(default, alias = "terminalId")]
    tid: Option<String>,
}

fn decode_connection_string(raw: &str) -> Option<ConnectionString> {
    let compact: String = raw.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.starts_with('{') {
        return serde_json::from_str(&compact).ok();
    }
    if compact.len() < 20 {
        return None;
    }
    let standard = compact.replace('-', "+").replace('_', "/");
    let padding = (4 - standard.len() % 4) % 4;
    let decoded = BASE64_STANDARD
        .decode(format!("{standard}{}", "=".repeat(padding)))
        .ok()?;
    serde_json::from_slice(&decoded).ok()
}

/// Expand an API key that is really a connection string. Values decoded
/// from the string win over separately configured ones.
fn expand(mut creds: PartialCredentials) -> PartialCredentials {
    let Some(raw) = creds.api_key.clone() else {
        return creds;
    };
    let Some(decoded) = decode_connection_string(&raw) else {
        return creds;
    };
    let non_empty = |v: Option<String>| v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty());

    if let Some(key) = non_empty(decoded.key) {
        creds.api_key = Some(key);
    }
    if let Some(tid) = non_empty(decoded.tid) {
        if let Some(existing) = creds.terminal_id.as_deref().filter(|t| *t != tid) {
            warn!(
                stored_terminal_id = existing,
                decoded_terminal_id = %tid,
                "terminal_id mismatch, preferring the connection string"
            );
        }
        creds.terminal_id = Some(tid);
    }
    if let Some(url) = non_empty(decoded.url) {
        creds.admin_url = Some(url);
    }
    creds
}

#[derive(Debug, Default)]
struct PartialCredentials {
    admin_url: Option<String>,
    api_key: Option<String>,
    terminal_id: Option<String>,
}

// ---------------------------------------------------------------------------
// High-level API
// ---------------------------------------------------------------------------

/// Resolve credentials from `primary` (the keyring) falling back to
/// `fallback` (the environment) per key.
fn resolve_with<P, F>(primary: P, fallback: F) -> Result<Credentials>
where
    P: Fn(&str) -> Option<String>,
    F: Fn(&str) -> Option<String>,
{
    let pick = |key: &str, env: &str| {
        primary(key)
            .or_else(|| fallback(env))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    };
    let creds = expand(PartialCredentials {
        admin_url: pick(KEY_ADMIN_URL, ENV_ADMIN_URL),
        api_key: pick(KEY_API_KEY, ENV_API_KEY),
        terminal_id: pick(KEY_TERMINAL_ID, ENV_TERMINAL_ID),
    });

    let missing = |name: &str| SyncError::NotConfigured(format!("missing {name}"));
    Ok(Credentials {
        admin_url: normalize_admin_url(&creds.admin_url.ok_or_else(|| missing(KEY_ADMIN_URL))?),
        api_key: creds.api_key.ok_or_else(|| missing(KEY_API_KEY))?,
        terminal_id: creds.terminal_id.ok_or_else(|| missing(KEY_TERMINAL_ID))?,
    })
}

/// Load terminal credentials: keyring first, then environment variables.
pub fn load_credentials() -> Result<Credentials> {
    resolve_with(get_credential, |name| std::env::var(name).ok())
}

/// The terminal is configured when all three credentials resolve.
pub fn is_configured() -> bool {
    load_credentials().is_ok()
}

/// Persist credentials (a connection string is accepted as the API key).
pub fn save_credentials(
    admin_url: Option<&str>,
    api_key: &str,
    terminal_id: Option<&str>,
) -> Result<()> {
    let creds = expand(PartialCredentials {
        admin_url: admin_url.map(str::to_string),
        api_key: Some(api_key.trim().to_string()).filter(|k| !k.is_empty()),
        terminal_id: terminal_id.map(str::to_string),
    });

    let api_key = creds
        .api_key
        .ok_or_else(|| SyncError::Config("Missing required field: apiKey".into()))?;
    let terminal_id = creds
        .terminal_id
        .ok_or_else(|| SyncError::Config("Missing required field: terminalId".into()))?;

    set_credential(KEY_API_KEY, &api_key)?;
    set_credential(KEY_TERMINAL_ID, &terminal_id)?;
    if let Some(url) = creds.admin_url {
        set_credential(KEY_ADMIN_URL, &normalize_admin_url(&url))?;
    }
    info!(terminal_id = %terminal_id, "terminal credentials updated");
    Ok(())
}

/// Delete every stored credential.
pub fn factory_reset() -> Result<()> {
    info!("performing factory reset, deleting all credentials");
    for key in ALL_KEYS {
        delete_credential(key)?;
    }
    Ok(())
}
