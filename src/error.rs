use std::io;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("invalid input: {0}")]
    InvalidInput(String),
    #[error("graph integrity violation: {0}")]
    Integrity(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("cascade delete would exceed the limit of {0} deletions")]
    CascadeLimit(usize),
    #[error("operation cancelled")]
    Cancelled,
}

impl StoreError {
    pub fn not_found(entity: &str, id: i64) -> Self {
        StoreError::NotFound(format!("{entity} with id {id}"))
    }

    pub fn already_exists(entity: &str, id: i64) -> Self {
        StoreError::AlreadyExists(format!("{entity} with id {id}"))
    }
}
