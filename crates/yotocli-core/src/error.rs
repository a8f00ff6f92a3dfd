//! Error types for YotoCLI core operations.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias using the crate's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Kind of library object a lookup was aimed at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    /// A card (playlist).
    Card,
    /// A chapter inside a card.
    Chapter,
    /// A physical player.
    Device,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Card => write!(f, "Playlist"),
            Self::Chapter => write!(f, "Track"),
            Self::Device => write!(f, "Device"),
        }
    }
}

/// Errors that can occur in YotoCLI core operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A query matched nothing.
    #[error("{kind} not found: {query}")]
    NotFound {
        /// What was being looked up.
        kind: EntityKind,
        /// The query as given by the caller.
        query: String,
    },

    /// A 1-based position outside the current chapter list.
    #[error("Invalid track index: {index} (playlist has {count} tracks)")]
    InvalidIndex {
        /// The rejected 1-based index.
        index: i64,
        /// Number of chapters at the time of the call.
        count: usize,
    },

    /// The remote service answered with a non-success status.
    #[error("{operation} failed with status {status}: {body}")]
    Upstream {
        /// Gateway operation name.
        operation: &'static str,
        /// HTTP status code.
        status: u16,
        /// Response body, as returned.
        body: String,
    },

    /// Transport failure talking to the remote service.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// A step of the upload-transcode pipeline failed.
    #[error("Upload failed while {stage}: {message}")]
    Pipeline {
        /// Stage that failed.
        stage: crate::upload::PipelineStage,
        /// Failure detail.
        message: String,
    },

    /// Transcoding did not finish inside the polling budget.
    #[error("Transcode of upload {upload_id} did not complete after {attempts} polls")]
    TranscodeTimeout {
        /// Upload being polled.
        upload_id: String,
        /// Poll attempts made.
        attempts: u32,
    },

    /// Terminal device-authorization failure.
    #[error("Authorization failed: {0}")]
    Auth(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// Loudness normalization failed.
    #[error("Normalization failed: {0}")]
    Normalization(String),

    /// Audio extraction from a URL failed.
    #[error("Download failed: {0}")]
    Download(String),

    /// Invalid argument supplied by the caller.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// File system operation failed.
    #[error("File system error at {path}: {message}")]
    FileSystem {
        /// Path where the error occurred.
        path: PathBuf,
        /// Error message.
        message: String,
    },

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// IO error wrapper.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl Error {
    /// Shorthand for a `NotFound` error.
    pub fn not_found(kind: EntityKind, query: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            query: query.into(),
        }
    }

    /// Whether the remote service rejected our credentials.
    #[must_use]
    pub fn is_unauthorized(&self) -> bool {
        match self {
            Self::Upstream { status, .. } => *status == 401 || *status == 403,
            Self::Http(e) => e.status().is_some_and(|s| s.as_u16() == 401),
            _ => false,
        }
    }
}
