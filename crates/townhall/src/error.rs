//! Error taxonomy for the memory subsystem.
//!
//! Structural errors (dimension mismatch, in-process index corruption)
//! surface immediately; environmental ones (transport, model backend) are
//! retried or degraded by the callers that see them.

use thiserror::Error;

/// Result alias for memory subsystem operations.
pub type Result<T> = std::result::Result<T, MemoryError>;

#[derive(Debug, Error)]
pub enum MemoryError {
    /// Broker unreachable. Fatal at startup, recoverable with backoff after.
    #[error("transport unavailable: {0}")]
    TransportUnavailable(String),

    /// Uniqueness violation on (stream, start, end). Not retried: the same
    /// range being summarized twice means the cursor double-processed it.
    #[error("duplicate summary record for stream '{stream}' range {start}..{end}")]
    DuplicateRecord {
        stream: String,
        start: String,
        end: String,
    },

    /// Embedding length disagrees with the configured index dimension.
    #[error("embedding dimension {actual} does not match index dimension {expected}")]
    DimensionMismatch { expected: usize, actual: usize },

    /// A zero-magnitude vector has no direction to normalize.
    #[error("cannot index or search a zero-magnitude vector")]
    ZeroVector,

    /// The summary id is already present in the vector index.
    #[error("summary id {0} is already present in the vector index")]
    AlreadyIndexed(i64),

    /// In-process parity violation between stored vectors and the id array.
    /// On-disk variants of this are downgraded to a logged empty-index
    /// recovery by `VectorIndex::load_or_create`.
    #[error("vector index corrupted: {0}")]
    CorruptIndex(String),

    /// Malformed record rejected at the store boundary.
    #[error("invalid summary record: {0}")]
    InvalidRecord(String),

    /// Model backend (llama-server) failure.
    #[error("model backend error: {0}")]
    Backend(String),

    /// A blocking worker task panicked or was cancelled.
    #[error("blocking task failed: {0}")]
    TaskJoin(String),

    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Encoding(#[from] bincode::Error),
}
