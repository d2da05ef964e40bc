//! Error types shared by every blobfs component

/// Result type for storage operations
pub type Result<T> = std::result::Result<T, StorageError>;

/// Errors that can occur inside a storage node
///
/// "Not found" on read paths is modelled as `Option`, not as an error;
/// `NotFound` is reserved for lookups the caller requires to succeed.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corruption in blob {blob_id} at offset {offset}: {detail}")]
    Corruption {
        blob_id: i64,
        offset: u64,
        detail: String,
    },

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Busy: {0}")]
    Busy(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Container closed: {0}")]
    ContainerClosed(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("I/O error: {0}")]
    Io(#[source] std::io::Error),
}

impl StorageError {
    pub fn corruption(blob_id: i64, offset: u64, detail: impl Into<String>) -> Self {
        Self::Corruption {
            blob_id,
            offset,
            detail: detail.into(),
        }
    }

    /// Whether the failure is expected to clear up on its own
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Busy(_) | Self::Transport(_))
    }
}

impl From<std::io::Error> for StorageError {
    /// Unwraps storage errors that travelled through an `io::Read` boundary
    fn from(e: std::io::Error) -> Self {
        let wraps_storage = e.get_ref().is_some_and(|inner| inner.is::<StorageError>());
        if !wraps_storage {
            return Self::Io(e);
        }
        match e.into_inner().map(|inner| inner.downcast::<StorageError>()) {
            Some(Ok(storage)) => *storage,
            _ => Self::Io(std::io::Error::other("storage error lost in io wrapper")),
        }
    }
}

impl From<StorageError> for std::io::Error {
    fn from(e: StorageError) -> Self {
        match e {
            StorageError::Io(io) => io,
            other => std::io::Error::new(std::io::ErrorKind::InvalidData, other),
        }
    }
}

impl From<rusqlite::Error> for StorageError {
    fn from(e: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(code, ref msg) = e {
            if code.code == rusqlite::ErrorCode::ConstraintViolation {
                return Self::Duplicate(msg.clone().unwrap_or_else(|| code.to_string()));
            }
        }
        Self::Database(e.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
