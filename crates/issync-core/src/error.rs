//! Error types for issync

use thiserror::Error;

use crate::remote::RemoteError;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid issue: {0}")]
    Validation(String),

    #[error("Issue not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A durable write failed; the mutation was rolled back.
    #[error("Failed to persist {path}: {source}")]
    Persistence {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote tracker error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Store not initialized. Run 'issync init' first.")]
    NotInitialized,

    #[error("Store already initialized at {0}")]
    AlreadyInitialized(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    pub(crate) fn persistence(path: &std::path::Path, source: std::io::Error) -> Self {
        Error::Persistence {
            path: path.display().to_string(),
            source,
        }
    }
}
