//! Error type for redb store operations

use waypoint_common::Error;

#[derive(Debug, thiserror::Error)]
pub enum RedbStoreError {
    #[error("redb error: {0}")]
    Database(#[from] redb::DatabaseError),
    #[error("redb storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("redb table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("redb transaction error: {0}")]
    Transaction(Box<redb::TransactionError>),
    #[error("redb commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error("redb compaction error: {0}")]
    Compaction(#[from] redb::CompactionError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Store(#[from] Error),
}

impl From<redb::TransactionError> for RedbStoreError {
    fn from(e: redb::TransactionError) -> Self {
        Self::Transaction(Box::new(e))
    }
}

impl From<RedbStoreError> for Error {
    fn from(e: RedbStoreError) -> Self {
        match e {
            RedbStoreError::Store(e) => e,
            RedbStoreError::Io(e) => Self::Io(e),
            RedbStoreError::Json(e) => Self::Codec(e),
            other => Self::Storage(other.to_string()),
        }
    }
}

pub type RedbResult<T> = Result<T, RedbStoreError>;
