//! Error taxonomy for the memory layer

use thiserror::Error;

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Main error type for memory store and retrieval operations
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Invalid input, including translated uniqueness / integrity violations
    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("too many concurrent writes to the same record, please retry")]
    LockAcquisitionFailed { key: u64, attempts: u32 },

    #[error(
        "embedding dimension mismatch: expected {expected}, got {found}; \
         configured dimensions must match the embedding model in use"
    )]
    EmbeddingMismatch { expected: usize, found: usize },

    #[error("storage error during {operation}: {source}")]
    Storage {
        operation: String,
        #[source]
        source: BoxError,
    },

    #[error("session {0} has ended")]
    SessionEnded(String),

    #[error("llm service error: {0}")]
    Llm(String),

    #[error("operation cancelled")]
    Cancelled,

    #[error("deadline exceeded after {0:?}")]
    DeadlineExceeded(std::time::Duration),

    #[error("configuration error: {0}")]
    Config(String),
}

/// Result type alias for memory operations
pub type Result<T> = std::result::Result<T, MemoryError>;

impl MemoryError {
    pub fn storage(operation: impl Into<String>, source: impl Into<BoxError>) -> Self {
        MemoryError::Storage {
            operation: operation.into(),
            source: source.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MemoryError::NotFound(_))
    }

    /// Translate a SQLite failure, turning constraint violations into `BadRequest`
    pub fn from_sqlite(operation: &str, err: rusqlite::Error) -> Self {
        if let rusqlite::Error::SqliteFailure(ref failure, ref message) = err {
            if failure.code == rusqlite::ErrorCode::ConstraintViolation {
                let detail = message.as_deref().unwrap_or_default();
                return MemoryError::BadRequest(describe_constraint(detail).to_string());
            }
        }
        if matches!(err, rusqlite::Error::QueryReturnedNoRows) {
            return MemoryError::NotFound(operation.to_string());
        }
        MemoryError::storage(operation, err)
    }
}

fn describe_constraint(detail: &str) -> &'static str {
    if detail.contains("UNIQUE") && detail.contains("session_id") {
        "session already exists"
    } else if detail.contains("UNIQUE") || detail.contains("PRIMARY KEY") {
        "identifier already exists"
    } else if detail.contains("FOREIGN KEY") {
        "referenced record does not exist"
    } else if detail.contains("NOT NULL") {
        "required field is missing"
    } else {
        "integrity constraint violated"
    }
}

/// Attach operation context to lower-level failures
pub trait StorageContext<T> {
    fn storage_context(self, operation: &str) -> Result<T>;
}

impl<T> StorageContext<T> for std::result::Result<T, rusqlite::Error> {
    fn storage_context(self, operation: &str) -> Result<T> {
        self.map_err(|e| MemoryError::from_sqlite(operation, e))
    }
}

impl<T> StorageContext<T> for std::result::Result<T, r2d2::Error> {
    fn storage_context(self, operation: &str) -> Result<T> {
        self.map_err(|e| MemoryError::storage(operation, e))
    }
}

impl<T> StorageContext<T> for std::result::Result<T, serde_json::Error> {
    fn storage_context(self, operation: &str) -> Result<T> {
        self.map_err(|e| MemoryError::storage(operation, e))
    }
}

impl<T> StorageContext<T> for std::result::Result<T, bincode::Error> {
    fn storage_context(self, operation: &str) -> Result<T> {
        self.map_err(|e| MemoryError::storage(operation, e))
    }
}

impl From<rusqlite::Error> for MemoryError {
    fn from(err: rusqlite::Error) -> Self {
        MemoryError::from_sqlite("sqlite", err)
    }
}

impl From<r2d2::Error> for MemoryError {
    fn from(err: r2d2::Error) -> Self {
        MemoryError::storage("connection pool", err)
    }
}

impl From<serde_json::Error> for MemoryError {
    fn from(err: serde_json::Error) -> Self {
        MemoryError::storage("json", err)
    }
}

impl From<bincode::Error> for MemoryError {
    fn from(err: bincode::Error) -> Self {
        MemoryError::storage("vector codec", err)
    }
}

impl From<tokio::task::JoinError> for MemoryError {
    fn from(err: tokio::task::JoinError) -> Self {
        if err.is_cancelled() {
            MemoryError::Cancelled
        } else {
            MemoryError::storage("background task", err)
        }
    }
}
