//! Scheduler errors.

use codefarm_core::ExecutorId;
use codefarm_db::DbError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] DbError),

    #[error(transparent)]
    Domain(#[from] codefarm_core::Error),

    #[error("executor {0} is not bound to a job")]
    Unbound(ExecutorId),

    #[error("event bus closed")]
    BusClosed,
}

pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
