//! Slave verification with a disposable diagnostic job.

use crate::control::Scheduler;
use crate::error::{SchedulerError, SchedulerResult};
use codefarm_core::events::Subscription;
use codefarm_core::{Event, Job, JobId, JobStatus, Slave};
use codefarm_db::JobRepo;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};

/// Result of [`Scheduler::verify_slave`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Verification {
    pub ok: bool,
    pub message: String,
}

impl Verification {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}

/// How the diagnostic job ended, as far as the waiter could tell.
enum Completion {
    Finished(Job),
    Removed,
}

impl Scheduler {
    /// Run a job pinned to `slave` and report whether it succeeded.
    ///
    /// Waits for the job to leave `ongoing`, bounded only by the configured
    /// verify timeout.
    pub async fn verify_slave(&self, slave: &Slave) -> SchedulerResult<Verification> {
        if slave.offline {
            return Ok(Verification::failed("Slave offline"));
        }

        let job = Job::new(
            format!("Verify_slave_{}", slave.id),
            "echo \"Verifying slave ${CF_SLAVE_ID} with job ${CF_JOB_ID}\"",
            slave.id.as_str(),
        )
        .with_baseline(json!({ "name": "verify_slave", "slave": slave.id.as_str() }))
        .with_requeue_on_failure(false);
        let job_id = job.id;

        // Subscribe first so the completion cannot slip past.
        let events = self.bus.subscribe();
        self.jobs.create(job).await?;
        info!(slave_id = %slave.id, job_id = %job_id, "Verifying slave");

        let completion = wait_for_completion(events, job_id, self.jobs.as_ref());
        let completion = match self.config.verify_timeout {
            Some(limit) => match tokio::time::timeout(limit, completion).await {
                Ok(completion) => completion?,
                Err(_) => {
                    warn!(slave_id = %slave.id, job_id = %job_id, "Slave verification timed out");
                    return Ok(Verification::failed(format!(
                        "Verification job {} did not finish within {}s",
                        job_id,
                        limit.as_secs()
                    )));
                }
            },
            None => completion.await?,
        };

        Ok(match completion {
            Completion::Finished(job) if job.status == JobStatus::Success => Verification {
                ok: true,
                message: "Slave verified".to_string(),
            },
            Completion::Finished(job) => Verification::failed(format!(
                "Verification job {} ended with status {}",
                job.id, job.status
            )),
            Completion::Removed => {
                Verification::failed(format!("Verification job {} was removed", job_id))
            }
        })
    }
}

/// Wait until `job_id` moves from `ongoing` to any other status.
async fn wait_for_completion(
    mut events: Subscription,
    job_id: JobId,
    jobs: &dyn JobRepo,
) -> SchedulerResult<Completion> {
    let mut previous = JobStatus::Queued;
    loop {
        match events.recv().await {
            Ok(Event::JobUpdated { job }) if job.id == job_id => {
                if previous == JobStatus::Ongoing && job.status != JobStatus::Ongoing {
                    return Ok(Completion::Finished(job));
                }
                previous = job.status;
            }
            Ok(Event::JobRemoved { job_id: removed }) if removed == job_id => {
                return Ok(Completion::Removed);
            }
            Ok(_) => {}
            Err(RecvError::Lagged(_)) => {
                let job = jobs.get(job_id).await?;
                if job.status.is_terminal() {
                    return Ok(Completion::Finished(job));
                }
                previous = job.status;
            }
            Err(RecvError::Closed) => return Err(SchedulerError::BusClosed),
        }
    }
}
