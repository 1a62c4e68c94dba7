//! Crate-wide error types.

use crate::catalog::TableId;
use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage kernel.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("buffer pool exhausted: every resident page is dirty")]
    ResourceExhausted,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("page is full: {0}")]
    PageFull(PageId),

    #[error("page not found: {0}")]
    PageNotFound(PageId),

    #[error("tuple not found: page {page_id}, slot {slot}")]
    TupleNotFound { page_id: PageId, slot: usize },

    #[error("tuple has no record id; it was never persisted")]
    TupleNotPersisted,

    #[error("table not found: {0}")]
    TableNotFound(TableId),

    #[error("table {0:?} already exists")]
    TableExists(String),

    #[error("no table named {0:?}")]
    TableNameNotFound(String),

    #[error("invariant violation: {0}")]
    InvariantViolation(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;
