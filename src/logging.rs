//! Structured logging: console plus a daily rolling file under
//! `{data_dir}/logs`, with old files pruned at startup.

use serde_json::{json, Value};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::error::{Result, SyncError};

/// Maximum number of rolled log files kept on disk.
pub const MAX_LOG_FILES: usize = 10;

const LOG_FILE_PREFIX: &str = "sync";
const DEFAULT_FILTER: &str = "info,pos_offline_sync=debug";

/// Platform data directory for the daemon (`POS_SYNC_DATA_DIR` overrides).
pub fn default_data_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("POS_SYNC_DATA_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    let base = std::env::var("LOCALAPPDATA")
        .or_else(|_| std::env::var("XDG_DATA_HOME"))
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            #[cfg(target_os = "windows")]
            {
                PathBuf::from(std::env::var("USERPROFILE").unwrap_or_else(|_| ".".into()))
                    .join("AppData")
                    .join("Local")
            }
            #[cfg(not(target_os = "windows"))]
            {
                PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| ".".into()))
                    .join(".local")
                    .join("share")
            }
        });
    base.join("pos-offline-sync")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Version, build timestamp, git SHA and platform.
pub fn about_info() -> Value {
    json!({
        "version": env!("CARGO_PKG_VERSION"),
        "buildTimestamp": env!("BUILD_TIMESTAMP"),
        "gitSha": env!("BUILD_GIT_SHA"),
        "platform": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

/// Keep only the newest `keep` log files in `dir`. Returns how many were
/// removed.
pub fn prune_old_logs(dir: &Path, keep: usize) -> usize {
    let Ok(entries) = fs::read_dir(dir) else {
        return 0;
    };

    let mut log_files: Vec<(PathBuf, std::time::SystemTime, String)> = entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            let name = path.file_name()?.to_str()?.to_string();
            if !path.is_file() || !name.starts_with(&format!("{LOG_FILE_PREFIX}.")) {
                return None;
            }
            let modified = entry
                .metadata()
                .ok()
                .and_then(|m| m.modified().ok())
                .unwrap_or(std::time::UNIX_EPOCH);
            Some((path, modified, name))
        })
        .collect();

    // Newest first; rolled names sort chronologically on mtime ties.
    log_files.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.2.cmp(&a.2)));

    let mut removed = 0;
    for (path, _, _) in log_files.iter().skip(keep) {
        match fs::remove_file(path) {
            Ok(()) => removed += 1,
            Err(e) => warn!("Failed to prune log file {}: {e}", path.display()),
        }
    }
    removed
}

/// Install the global subscriber. The returned guard flushes the file
/// writer on drop and must live as long as the process.
pub fn init_logging(data_dir: &Path, json_console: bool) -> Result<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let dir = log_dir(data_dir);
    fs::create_dir_all(&dir)?;
    prune_old_logs(&dir, MAX_LOG_FILES);

    let file_appender = tracing_appender::rolling::daily(&dir, LOG_FILE_PREFIX);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true);

    let registry = tracing_subscriber::registry().with(env_filter).with(file_layer);
    let installed = if json_console {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };
    installed.map_err(|e| SyncError::Config(format!("logging already initialised: {e}")))?;

    Ok(guard)
}
