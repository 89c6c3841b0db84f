//! Index error types

use thiserror::Error;

/// Index result type
pub type IndexResult<T> = Result<T, IndexError>;

/// Index errors
#[derive(Error, Debug)]
pub enum IndexError {
    /// tantivy-level failure
    #[error("Index error: {0}")]
    Tantivy(#[from] tantivy::TantivyError),

    /// IO error on the index directory
    #[error("Index IO error: {0}")]
    Io(#[from] std::io::Error),
}
