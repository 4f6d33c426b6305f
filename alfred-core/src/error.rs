//! Error types for the state engine.

use std::path::PathBuf;

use thiserror::Error;

/// Errors surfaced by [`crate::store::Store`] operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing file could not be read.
    #[error("unable to read store file {}: {source}", path.display())]
    Unreadable {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The backing file did not contain a JSON document.
    #[error("unable to parse store file {}: {source}", path.display())]
    Undecodable {
        /// Path that was attempted.
        path: PathBuf,
        /// Underlying decode error.
        #[source]
        source: serde_json::Error,
    },

    /// An operation requires a mobilized store.
    #[error("store is not mobilized")]
    NotMobilized,

    /// The caller's roles do not permit the requested mutation.
    #[error("access denied for {operation} at {path}")]
    AccessDenied {
        /// Operation that was refused.
        operation: &'static str,
        /// Slash-joined path of the refused mutation.
        path: String,
    },

    /// The mutation path does not address a writable location.
    #[error("invalid mutation path: {0}")]
    InvalidPath(String),
}
