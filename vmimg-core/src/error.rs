//! Error taxonomy shared by every vmimg component

use std::path::PathBuf;

/// Result type for mirror, store and query operations
pub type Result<T> = std::result::Result<T, MirrorError>;

/// Errors that can occur while mirroring or querying an image catalog
#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Malformed filter expression: {0:?} (expected field=value or field~regex)")]
    MalformedFilter(String),

    #[error("Invalid pattern in filter {expr:?}: {source}")]
    InvalidPattern {
        expr: String,
        #[source]
        source: regex::Error,
    },

    #[error("Integrity check failed for {path}: {reason}")]
    Integrity { path: String, reason: String },

    #[error("Not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("Failed to decode {}: {source}", .path.display())]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Network error: {0}")]
    Network(String),

    #[error("Signature verification failed for {path}: {reason}")]
    Signature { path: String, reason: String },

    #[error("Path escapes the store root: {0:?}")]
    PathEscape(String),

    #[error("Field {field:?} missing from record")]
    MissingField { field: String },

    #[error("Bad output format {template:?}: {reason}")]
    Format { template: String, reason: String },

    #[error("Unsupported catalog format {format:?} in {path}")]
    UnsupportedFormat { path: String, format: String },
}

impl MirrorError {
    /// True when the error is an `EPIPE` from a closed output stream.
    pub fn is_broken_pipe(&self) -> bool {
        matches!(self, MirrorError::Io(e) if e.kind() == std::io::ErrorKind::BrokenPipe)
    }

    /// True for errors raised because something does not exist locally.
    pub fn is_not_found(&self) -> bool {
        match self {
            MirrorError::NotFound(_) => true,
            MirrorError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

impl From<reqwest::Error> for MirrorError {
    fn from(e: reqwest::Error) -> Self {
        MirrorError::Network(e.to_string())
    }
}
