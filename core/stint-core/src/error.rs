//! Error types for stint-core operations.
//!
//! Local-store failures are synchronous and fatal to the triggering call.
//! Mirror failures never travel through this type to a `start`/`stop` caller;
//! they are converted into [`TrackerError::MirrorSync`] reports by the mirror
//! health sink only.

use std::path::PathBuf;

/// All errors that can occur in stint-core operations.
#[derive(Debug, thiserror::Error)]
pub enum TrackerError {
    // ─────────────────────────────────────────────────────────────────────
    // Local store
    // ─────────────────────────────────────────────────────────────────────
    #[error("Persistence error: {context}: {source}")]
    Persistence {
        context: String,
        #[source]
        source: rusqlite::Error,
    },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Data integrity violation: {0}")]
    Integrity(String),

    // ─────────────────────────────────────────────────────────────────────
    // Caller preconditions
    // ─────────────────────────────────────────────────────────────────────
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid input: {field}: {reason}")]
    InvalidInput { field: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Remote mirror (observed only)
    // ─────────────────────────────────────────────────────────────────────
    #[error("Mirror sync failed: {0}")]
    MirrorSync(String),

    // ─────────────────────────────────────────────────────────────────────
    // Configuration / runtime
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration file malformed: {path}: {details}")]
    Config { path: PathBuf, details: String },

    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("No tokio runtime available to host background tasks")]
    Runtime,
}

impl TrackerError {
    pub fn persistence(context: impl Into<String>, source: rusqlite::Error) -> Self {
        TrackerError::Persistence {
            context: context.into(),
            source,
        }
    }

    pub fn invalid(field: &str, reason: impl Into<String>) -> Self {
        TrackerError::InvalidInput {
            field: field.to_string(),
            reason: reason.into(),
        }
    }

    /// Stable snake_case code used on the daemon wire.
    pub fn code(&self) -> &'static str {
        match self {
            TrackerError::Persistence { .. } => "persistence_error",
            TrackerError::NotFound(_) => "not_found",
            TrackerError::Integrity(_) => "integrity_error",
            TrackerError::Precondition(_) => "precondition_failed",
            TrackerError::InvalidInput { .. } => "invalid_params",
            TrackerError::MirrorSync(_) => "mirror_sync_error",
            TrackerError::Config { .. } => "config_error",
            TrackerError::Io { .. } => "io_error",
            TrackerError::Runtime => "runtime_unavailable",
        }
    }
}

/// Convenience type alias for Results using TrackerError.
pub type Result<T> = std::result::Result<T, TrackerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(
            TrackerError::NotFound("activity 4".to_string()).code(),
            "not_found"
        );
        assert_eq!(
            TrackerError::Precondition("no user".to_string()).code(),
            "precondition_failed"
        );
        assert_eq!(
            TrackerError::invalid("name", "must not be empty").code(),
            "invalid_params"
        );
    }

    #[test]
    fn persistence_message_includes_context() {
        let err = TrackerError::persistence(
            "Failed to insert session",
            rusqlite::Error::QueryReturnedNoRows,
        );
        assert!(err.to_string().contains("Failed to insert session"));
    }
}
