//! Error types for reconcile-core operations.

use std::path::PathBuf;
use std::time::Duration;

/// All errors that can occur while collecting, reconciling, or persisting state.
///
/// Per-entity failures (one unreadable process, one corrupt record, one lock
/// timeout) are recovered by the caller; only [`ReconcileError::StateDirUnreadable`]
/// and configuration errors end a pass.
#[derive(Debug, thiserror::Error)]
pub enum ReconcileError {
    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Invalid identity rule for {worker_id}: {details}")]
    InvalidRule { worker_id: String, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Structural Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("State directory unreadable: {path}: {source}")]
    StateDirUnreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    // ─────────────────────────────────────────────────────────────────────
    // Write Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Invalid worker id: {worker_id:?}")]
    InvalidWorkerId { worker_id: String },

    #[error("Timed out after {waited:?} waiting for lock {path}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ReconcileError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        ReconcileError::Io {
            context: context.into(),
            source,
        }
    }

    pub(crate) fn json(context: impl Into<String>, source: serde_json::Error) -> Self {
        ReconcileError::Json {
            context: context.into(),
            source,
        }
    }
}

/// Convenience type alias for Results using ReconcileError.
pub type Result<T> = std::result::Result<T, ReconcileError>;
