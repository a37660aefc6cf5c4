//! Error types for Skiff

use thiserror::Error;

/// Result type alias using Skiff Error
pub type Result<T> = std::result::Result<T, Error>;

/// Skiff error types
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Store error: {0}")]
    Store(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Resource not found: {kind} with id {id}")]
    NotFound { kind: String, id: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Validation error: {0}")]
    Validation(String),

    /// Editor optimistic-concurrency conflict; carries the current revision.
    #[error("Revision conflict (current rev {current})")]
    Conflict { current: u64 },

    #[error("QEMU error: {0}")]
    Qemu(String),

    #[error("SSH error: {0}")]
    Ssh(String),

    #[error("Upstream error: {0}")]
    Upstream(String),

    #[error("Operation timeout after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Error::NotFound {
            kind: kind.into(),
            id: id.into(),
        }
    }

    /// HTTP status for the error kind; both servers return errors as
    /// JSON envelopes with this status.
    pub fn http_status(&self) -> u16 {
        match self {
            Error::NotFound { .. } => 404,
            Error::PermissionDenied(_) => 403,
            Error::Validation(_) | Error::InvalidConfig(_) => 400,
            Error::Conflict { .. } => 409,
            Error::Timeout { .. } => 500,
            _ => 500,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping_per_kind() {
        assert_eq!(Error::not_found("vm", "x").http_status(), 404);
        assert_eq!(Error::PermissionDenied("quota".into()).http_status(), 403);
        assert_eq!(Error::Validation("bad path".into()).http_status(), 400);
        assert_eq!(Error::Conflict { current: 3 }.http_status(), 409);
        assert_eq!(Error::Upstream("ssh".into()).http_status(), 500);
    }
}
