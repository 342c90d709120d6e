//! Error types for the offline sync engine.
//!
//! `ApiError` describes how a single request to the admin dashboard went
//! wrong and decides whether the sync manager may retry it. `SyncError` is
//! the crate-wide error returned by the local store and the orchestrators.

use serde_json::Value;
use thiserror::Error;

use crate::models::TransactionStatus;

/// Failure of one request against the admin dashboard.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// Timeout, refused connection, DNS failure and friends.
    #[error("{0}")]
    Network(String),

    /// The server rejected the payload (stock insufficient, product missing).
    /// Retrying without user correction fails identically.
    #[error("{message}")]
    Validation {
        message: String,
        invalid_items: Vec<String>,
    },

    /// The server-side record diverged from the queued version.
    #[error("{message}")]
    Conflict {
        message: String,
        server_snapshot: Value,
    },

    /// Any other non-success HTTP response.
    #[error("{message} (HTTP {status})")]
    Server { status: u16, message: String },

    /// A success response whose body could not be understood.
    #[error("Invalid response from admin dashboard: {0}")]
    InvalidResponse(String),
}

impl ApiError {
    /// Network failures and 5xx/429 responses are transient. Everything
    /// else needs a human (validation, conflict) or a code fix.
    pub fn is_retryable(&self) -> bool {
        match self {
            ApiError::Network(_) => true,
            ApiError::Server { status, .. } => *status >= 500 || *status == 429 || *status == 408,
            ApiError::InvalidResponse(_) => true,
            ApiError::Validation { .. } | ApiError::Conflict { .. } => false,
        }
    }

    /// Credentials rejected. Nothing queued can succeed until the terminal
    /// is reconfigured, so the drain stops without spending retries.
    pub fn is_auth_failure(&self) -> bool {
        matches!(self, ApiError::Server { status: 401 | 403, .. })
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("storage lock poisoned")]
    LockPoisoned,

    #[error("transaction {0} not found")]
    NotFound(String),

    #[error("invalid status transition for {local_id}: {from} -> {to}")]
    InvalidTransition {
        local_id: String,
        from: TransactionStatus,
        to: TransactionStatus,
    },

    #[error("transaction {local_id} violates invariant: {reason}")]
    Invariant { local_id: String, reason: String },

    #[error("transaction {local_id} is not in conflict (status {status})")]
    NotInConflict {
        local_id: String,
        status: TransactionStatus,
    },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("terminal not configured: {0}")]
    NotConfigured(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Api(#[from] ApiError),
}

impl<T> From<std::sync::PoisonError<T>> for SyncError {
    fn from(_: std::sync::PoisonError<T>) -> Self {
        SyncError::LockPoisoned
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
