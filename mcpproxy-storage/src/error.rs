//! Storage error types

use thiserror::Error;

/// Storage result type
pub type StorageResult<T> = Result<T, StorageError>;

/// Storage errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// Underlying key-value store error
    #[error("Database error: {0}")]
    Database(#[from] sled::Error),

    /// Another process holds the database lock
    #[error("Storage is locked by another process: {path}")]
    Locked { path: String },

    /// Data directory permissions are too loose to hold secrets
    #[error("Insecure data directory {path} (mode {mode:o}); run: chmod 0700 {path}")]
    InsecureDataDir { path: String, mode: u32 },

    /// Serialization failure for a stored value
    #[error("Failed to (de)serialize stored value: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Record not found
    #[error("Not found: {0}")]
    NotFound(String),

    /// IO error on the data directory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// CSV export failure
    #[error("Export error: {0}")]
    Export(String),
}
