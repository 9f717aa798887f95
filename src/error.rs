//! Error types for Noema

use thiserror::Error;

/// Result type alias for Noema operations
pub type Result<T> = std::result::Result<T, NoemaError>;

/// Main error type for Noema
#[derive(Error, Debug)]
pub enum NoemaError {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Memory not found: {0}")]
    MemoryNotFound(String),

    #[error("Node not found: {0}")]
    NodeNotFound(String),

    #[error("Ambiguous node name '{name}': {count} matches")]
    AmbiguousNode { name: String, count: usize },

    #[error("Edge endpoint missing: {0}")]
    EdgeEndpointMissing(String),

    #[error("Version conflict on memory {id}: expected {expected}, found {found}")]
    VersionConflict { id: String, expected: i64, found: i64 },

    #[error("Extraction error: {0}")]
    Extraction(String),

    #[error("Embedding error: {0}")]
    Embedding(String),

    #[error("Supersession error: {0}")]
    Supersession(String),

    #[error("Operation cancelled: {0}")]
    Cancelled(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(feature = "openai")]
    Http(#[from] reqwest::Error),

    #[error("HTTP request error: {0}")]
    #[cfg(not(feature = "openai"))]
    Http(String),
}

impl NoemaError {
    /// Check if error is retryable (provider-side transient failures)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            NoemaError::Extraction(_) | NoemaError::Embedding(_) | NoemaError::Http(_)
        )
    }

    /// Check if error was caused by cancellation or deadline expiry
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NoemaError::Cancelled(_))
    }
}
