//! Error types

use thiserror::Error;

/// Reasons a commit cycle is rejected before anything is persisted
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Insufficient sources: {available} < {required}")]
    InsufficientSources { required: usize, available: usize },

    #[error("Stale data: {fresh} fresh sources < {required} required")]
    StaleData { required: usize, fresh: usize },

    #[error("Update too frequent: {elapsed_ms}ms since last commit < {min_ms}ms")]
    TooFrequent { elapsed_ms: u64, min_ms: u64 },

    #[error("Malformed price point: {0}")]
    MalformedPoint(String),
}

impl ValidationError {
    /// Stable label used for metrics and alert payloads
    pub fn reason(&self) -> &'static str {
        match self {
            ValidationError::InsufficientSources { .. } => "insufficient_sources",
            ValidationError::StaleData { .. } => "stale_data",
            ValidationError::TooFrequent { .. } => "too_frequent",
            ValidationError::MalformedPoint(_) => "malformed_point",
        }
    }

    /// Rate limiting is expected back-pressure, not a fault
    pub fn is_rate_limit(&self) -> bool {
        matches!(self, ValidationError::TooFrequent { .. })
    }
}

/// Price store errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Out of order write for {asset_id}: {timestamp} <= last stored {last}")]
    OutOfOrderWrite {
        asset_id: String,
        timestamp: String,
        last: String,
    },

    #[error("Storage I/O failure: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Only I/O failures are worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, StorageError::Io(_))
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Errors surfaced by the engine's public operations
#[derive(Debug, Error)]
pub enum OracleError {
    #[error("No price committed for {0}")]
    NotFound(String),

    #[error("Asset {0} not configured")]
    UnknownAsset(String),

    #[error("Source {source_id} not configured for {asset_id}")]
    UnknownSource { asset_id: String, source_id: String },

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Invalid policy: {0}")]
    InvalidPolicy(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Result type alias
pub type OracleResult<T> = Result<T, OracleError>;
pub type StorageResult<T> = Result<T, StorageError>;
