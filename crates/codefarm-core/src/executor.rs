//! Executor contract.
//!
//! An executor is one binding of a job to a slave, plus the state of its
//! remote run. Backends (local process, remote agents, ...) implement
//! [`Executor`]; the scheduler only ever talks to this trait.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::callback::CallbackReply;
use crate::job::Job;
use crate::slave::Slave;
use crate::{Error, ExecutorId, JobId, Result, SlaveId};

/// Lifecycle state of an executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorState {
    #[display("unallocated")]
    Unallocated,
    #[display("allocated")]
    Allocated,
    #[display("started")]
    Started,
    #[display("finished")]
    Finished,
    #[display("failed")]
    Failed,
    #[display("aborted")]
    Aborted,
}

impl ExecutorState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecutorState::Finished | ExecutorState::Failed | ExecutorState::Aborted
        )
    }

    /// Whether the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: ExecutorState) -> bool {
        use ExecutorState::*;
        match (self, next) {
            (Unallocated, Allocated) => true,
            (Allocated, Started) => true,
            (Started, Finished) | (Started, Failed) => true,
            // A run can be lost before it ever started.
            (Allocated, Failed) => true,
            (from, Aborted) => !from.is_terminal(),
            _ => false,
        }
    }
}

/// Persisted view of an executor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorRecord {
    pub id: ExecutorId,
    pub job_id: Option<JobId>,
    pub slave_id: Option<SlaveId>,
    pub log_id: Option<String>,
    pub state: ExecutorState,
}

impl ExecutorRecord {
    pub fn new(id: ExecutorId) -> Self {
        Self {
            id,
            job_id: None,
            slave_id: None,
            log_id: None,
            state: ExecutorState::Unallocated,
        }
    }

    /// Move to `next`, rejecting transitions the state machine forbids.
    pub fn transition(&mut self, next: ExecutorState) -> Result<()> {
        if !self.state.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "executor {} cannot go from {} to {}",
                self.id, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Bind job and slave and enter `allocated`.
    pub fn bind(&mut self, job_id: JobId, slave_id: SlaveId) -> Result<()> {
        self.transition(ExecutorState::Allocated)?;
        self.job_id = Some(job_id);
        self.slave_id = Some(slave_id);
        Ok(())
    }
}

/// One active remote job run.
///
/// Lifecycle calls report progress asynchronously through the event bus
/// (`executor.allocated`, `executor.started`, `executor.finished`,
/// `executor.failure`, `executor.removed`). Implementations keep their
/// record in the executor store from allocation until they conclude.
#[async_trait]
pub trait Executor: Send + Sync {
    fn id(&self) -> ExecutorId;

    /// Snapshot of the executor's current record.
    async fn record(&self) -> ExecutorRecord;

    /// Bind to `job` on `slave` and persist.
    async fn allocate(&self, job: &Job, slave: &Slave) -> Result<()>;

    /// Begin remote execution of `job`.
    async fn start(&self, job: &Job) -> Result<()>;

    /// Best-effort cancellation of a non-terminal run.
    async fn abort(&self) -> Result<()>;

    /// Reattach to a run started by a previous scheduler process.
    async fn resume(&self) -> Result<()>;

    /// Stop listening to the run without aborting it.
    async fn detach(&self) -> Result<()>;

    /// Fetch a file produced by the run.
    async fn download_file(&self, path: &str) -> Result<Bytes>;

    /// Answer a callback request from the running script.
    async fn notify_info(&self, reply: CallbackReply) -> Result<()>;

    /// Report a failed callback request to the running script.
    async fn notify_error(&self, message: String) -> Result<()>;
}

/// Creates executors for new allocations and rebuilds persisted ones.
pub trait ExecutorFactory: Send + Sync {
    fn create(&self) -> Arc<dyn Executor>;

    fn restore(&self, record: ExecutorRecord) -> Arc<dyn Executor>;
}
