use std::path::PathBuf;
use thiserror::Error;

/// Storage-specific error types for the pethub JSON files.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Reading, writing or renaming a file failed
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// File content is not the expected JSON shape
    #[error("Malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Data validation failed
    #[error("Validation error: {0}")]
    Validation(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        Self::Json {
            path: path.into(),
            source,
        }
    }
}

/// Specialized result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for pethub_core::Error {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::Validation(message) => pethub_core::Error::Config(message),
            other => pethub_core::Error::Storage(other.to_string()),
        }
    }
}
