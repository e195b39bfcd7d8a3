use thiserror::Error;

/// Storage layer errors
#[derive(Error, Debug)]
pub enum StorageError {
    /// A record already exists at the timestamp
    #[error("Duplicate record at {0}")]
    DuplicateRecord(String),

    /// Naive, unparseable or out-of-range time input
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),

    /// Backend could not be opened or has been closed
    #[error("Backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Backend I/O failure during an operation
    #[error("Backend error: {0}")]
    Backend(String),

    /// Stored bytes could not be decompressed or decoded
    #[error("Data corruption in record {key}: {reason}")]
    DataCorruption { key: String, reason: String },

    /// Configuration error
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Invalid parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Compaction or vacuum error
    #[error("Retention policy error: {0}")]
    RetentionError(String),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl StorageError {
    /// Whether the caller can recover by choosing another action
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            StorageError::DuplicateRecord(_) | StorageError::DataCorruption { .. }
        )
    }
}

impl From<heed::Error> for StorageError {
    fn from(err: heed::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(err: rusqlite::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<std::io::Error> for StorageError {
    fn from(err: std::io::Error) -> Self {
        StorageError::Backend(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::SerializationError(err.to_string())
    }
}

impl From<serde_yaml::Error> for StorageError {
    fn from(err: serde_yaml::Error) -> Self {
        StorageError::ConfigError(err.to_string())
    }
}

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;
