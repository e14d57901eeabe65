//! Errors raised by the identity and cold-state databases.

use thiserror::Error;

/// A result type using `StoreError`.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur while reading or writing VM records.
#[derive(Debug, Error)]
pub enum StoreError {
    /// No entry is stored under this VM ID.
    #[error("vm not found: {0}")]
    NotFound(String),

    /// The database was opened without one of the vmfleet column families.
    #[error("column family missing: {0}")]
    MissingColumnFamily(String),

    /// `RocksDB` reported an error.
    #[error("database error: {0}")]
    Database(String),

    /// A record could not be encoded to or decoded from CBOR.
    #[error("serialization error: {0}")]
    Serialization(String),
}
