/// Failure taxonomy shared by every storage backend.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Required backend configuration (root path, credentials, folder or
    /// drive identifiers) is absent.
    #[error("Storage not configured: {0}")]
    ConfigurationMissing(String),
    /// Transient provider or network failure. Safe to retry.
    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),
    /// The write did not complete; no reference to the file may be kept.
    #[error("Storage write failed: {0}")]
    StorageWriteFailed(String),
    #[error("File not found: {0}")]
    FileNotFound(String),
    /// Input was rejected before any backend call was attempted.
    #[error("Validation failed: {0}")]
    ValidationFailed(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

impl StorageError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::StorageUnavailable(_))
    }

    /// Stable machine-readable code for API error bodies.
    pub fn code(&self) -> &'static str {
        match self {
            StorageError::ConfigurationMissing(_) => "storage_not_configured",
            StorageError::StorageUnavailable(_) => "storage_unavailable",
            StorageError::StorageWriteFailed(_) => "storage_write_failed",
            StorageError::FileNotFound(_) => "file_not_found",
            StorageError::ValidationFailed(_) => "validation_failed",
        }
    }
}
