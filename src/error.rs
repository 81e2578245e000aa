//! Error types for frans.

use thiserror::Error;

/// Common error type for frans.
#[derive(Error, Debug)]
pub enum FransError {
    /// Database error.
    ///
    /// Errors from sqlx are converted into this variant automatically.
    #[error("database error: {0}")]
    Database(String),

    /// Database connection error.
    #[error("database connection error: {0}")]
    DatabaseConnection(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Permission denied error.
    #[error("permission denied: {0}")]
    Permission(String),

    /// Validation error for user input.
    #[error("validation error: {0}")]
    Validation(String),

    /// Upload exceeds the configured maximum size.
    #[error("file too large: {size} bytes exceeds the limit of {max} bytes")]
    FileTooLarge { size: u64, max: u64 },

    /// Upload would exceed the configured maximum number of files.
    #[error("too many files: {count} exceeds the limit of {max}")]
    TooManyFiles { count: usize, max: usize },

    /// Resource not found.
    #[error("{0} not found")]
    NotFound(String),

    /// Database rows and on-disk blobs disagree.
    #[error("consistency error: {0}")]
    Consistency(String),

    /// Configuration error.
    #[error("configuration error: {0}")]
    Config(String),
}

impl FransError {
    /// Whether this error should be reported back to the uploader.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            FransError::Validation(_)
                | FransError::FileTooLarge { .. }
                | FransError::TooManyFiles { .. }
        )
    }
}

// Conversion from sqlx errors
impl From<sqlx::Error> for FransError {
    fn from(e: sqlx::Error) -> Self {
        FransError::Database(e.to_string())
    }
}

/// Result type alias for frans operations.
pub type Result<T> = std::result::Result<T, FransError>;
