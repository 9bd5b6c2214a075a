//! Storage layer error types.
//!
//! The taxonomy distinguishes fatal medium failures (`Io`, `Corruption`)
//! from retryable concurrency conditions (`BufferPoolExhausted`,
//! `SerializationConflict`) and from caller misuse. Fatal errors are never
//! swallowed or retried internally.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors surfaced by the storage core.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption detected: {0}")]
    Corruption(String),

    #[error("buffer pool exhausted: no evictable frame")]
    BufferPoolExhausted,

    #[error("serialization conflict: a concurrent transaction committed a conflicting write")]
    SerializationConflict,

    #[error("constraint violation: {0}")]
    ConstraintViolation(String),

    #[error("backing file cannot grow")]
    OutOfSpace,

    #[error("page {0:?} does not exist")]
    PageNotFound(PageId),

    #[error("file {0} is not registered with the buffer pool")]
    FileNotFound(u32),

    #[error("transaction {0} is not active")]
    TxnNotActive(u64),

    #[error("table not found: {0}")]
    TableNotFound(String),

    #[error("index not found: {0}")]
    IndexNotFound(String),

    #[error("table already exists: {0}")]
    DuplicateTable(String),

    #[error("index already exists: {0}")]
    DuplicateIndex(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Whether the caller may retry the failed operation without
    /// restarting the engine.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            StorageError::BufferPoolExhausted | StorageError::SerializationConflict
        )
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
