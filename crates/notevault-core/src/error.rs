//! Error types for the note-versioning engine.
//!
//! All errors in the system are represented by the [`Error`] enum.
//! This ensures composable error handling across crates.

use std::io;
use std::path::PathBuf;
use thiserror::Error as ThisError;

/// The core error type for all NoteVault operations.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Malformed id, path or input
    #[error("Validation error: {reason}")]
    Validation { reason: String },

    /// File system error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// File system error tied to a specific path
    #[error("I/O error at {path}: {source}")]
    IoAt {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Unparseable record or content-hash mismatch
    #[error("Corrupt data: {reason}")]
    CorruptData { reason: String },

    /// Identity changed while an operation was suspended
    #[error("Concurrency conflict: {reason}")]
    ConcurrencyConflict { reason: String },

    /// Referenced manifest, version or edit is absent
    #[error("Not found: {key}")]
    NotFound { key: String },

    /// Embedded edit-history database failure
    #[error("Database error: {reason}")]
    Database { reason: String },

    /// JSON / YAML (de)serialization failure on a write path
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    /// Generic unclassified error
    #[error("Error: {0}")]
    Other(String),
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Create an IO error
    pub fn io(err: io::Error) -> Self {
        Error::Io(err)
    }

    /// Create an IO error annotated with the path it happened at
    pub fn io_at(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Error::IoAt {
            path: path.into(),
            source,
        }
    }

    /// Create a validation error
    pub fn validation(reason: impl Into<String>) -> Self {
        Error::Validation {
            reason: reason.into(),
        }
    }

    /// Create a corrupt data error
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Error::CorruptData {
            reason: reason.into(),
        }
    }

    /// Create a concurrency conflict error
    pub fn conflict(reason: impl Into<String>) -> Self {
        Error::ConcurrencyConflict {
            reason: reason.into(),
        }
    }

    /// Create a not found error
    pub fn not_found(key: impl Into<String>) -> Self {
        Error::NotFound { key: key.into() }
    }

    /// Create a database error
    pub fn database(reason: impl Into<String>) -> Self {
        Error::Database {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config_error(reason: impl Into<String>) -> Self {
        Error::Config {
            reason: reason.into(),
        }
    }

    /// Create a generic error
    pub fn other(msg: impl Into<String>) -> Self {
        Error::Other(msg.into())
    }

    /// True when the error means "the thing is not there"
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Io(e) | Error::IoAt { source: e, .. } => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
