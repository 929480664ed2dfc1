//! Store error types.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("duplicate: {0}")]
    Duplicate(String),

    #[error(transparent)]
    Domain(#[from] codefarm_core::Error),
}

pub type DbResult<T> = std::result::Result<T, DbError>;
