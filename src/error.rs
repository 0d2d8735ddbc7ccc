// Error types for the dispatch path and the cache path.

use std::path::PathBuf;

/// Token bucket construction failures. These are configuration mistakes and
/// surface at startup, never at first acquire.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BucketError {
    #[error("rate of {0} requests/minute yields zero tokens per second (minimum is 60)")]
    ZeroRate(u32),
    #[error("token bucket capacity must be at least 1")]
    ZeroCapacity,
    #[error("token bucket refill interval must be non-zero")]
    ZeroInterval,
}

/// Failure to obtain a token from the dispatcher.
#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum DispatchError {
    #[error("token bucket has been shut down")]
    Closed,
}

/// A single remote query failed.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("request to {url} failed: {message}")]
    Transport { url: String, message: String },
    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("could not decode response from {url}: {message}")]
    Decode { url: String, message: String },
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error("chunk task aborted: {0}")]
    Join(String),
}

/// A failed chunk inside a batched query, tagged with its position.
#[derive(Debug, thiserror::Error)]
#[error("chunk {index} failed: {error}")]
pub struct ChunkError {
    pub index: usize,
    #[source]
    pub error: QueryError,
}

/// Persistence failures for a single store file.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("i/o error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{} does not contain a valid store snapshot: {source}", .path.display())]
    Corrupt {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to serialize store for {}: {source}", .path.display())]
    Serialize {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Registry lookups and definitions.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("database '{0}' is not registered")]
    DatabaseNotFound(String),
    #[error("store '{store}' is not defined in database '{database}'")]
    StoreNotFound { database: String, store: String },
    #[error("store '{store}' holds {actual}, not {requested}")]
    TypeMismatch {
        store: String,
        requested: &'static str,
        actual: &'static str,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("store loading task failed: {0}")]
    Task(String),
}

/// Every store that failed to snapshot during a database flush.
#[derive(Debug, thiserror::Error)]
#[error("{} store(s) failed to flush in '{database}'", .failures.len())]
pub struct FlushError {
    pub database: String,
    pub failures: Vec<(String, StoreError)>,
}
