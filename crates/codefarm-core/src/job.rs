//! Jobs and their run records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::criteria::{CriteriaError, TagCriteria};
use crate::{Error, JobId, Result, SlaveId};

/// Status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[display("queued")]
    Queued,
    #[display("ongoing")]
    Ongoing,
    #[display("success")]
    Success,
    #[display("fail")]
    Fail,
    #[display("aborted")]
    Aborted,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Success | JobStatus::Fail | JobStatus::Aborted)
    }
}

/// Final result reported when a run ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, derive_more::Display)]
#[serde(rename_all = "lowercase")]
pub enum JobResult {
    #[display("success")]
    Success,
    #[display("fail")]
    Fail,
    #[display("aborted")]
    Aborted,
}

impl From<JobResult> for JobStatus {
    fn from(result: JobResult) -> Self {
        match result {
            JobResult::Success => JobStatus::Success,
            JobResult::Fail => JobStatus::Fail,
            JobResult::Aborted => JobStatus::Aborted,
        }
    }
}

/// Artifact produced by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactRef {
    pub id: String,
    pub name: String,
    pub repository: String,
    pub version: Option<String>,
}

/// Log archived for a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRef {
    pub id: String,
    pub name: String,
}

/// Revision touched by a run (e.g. merged).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevisionRef {
    pub id: String,
    pub state: String,
}

/// Sub-job spawned by a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubJobRef {
    pub id: String,
    pub name: String,
}

/// One execution attempt of a job on a slave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRun {
    pub index: usize,
    pub slave_id: SlaveId,
    pub log_id: Option<String>,
    pub allocated: DateTime<Utc>,
    pub started: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub status: JobStatus,
    pub artifacts: Vec<ArtifactRef>,
    pub logs: Vec<LogRef>,
    pub revisions: Vec<RevisionRef>,
    pub sub_jobs: Vec<SubJobRef>,
}

/// A unit of schedulable work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub script: String,
    /// Tag criteria a slave must satisfy.
    pub criteria: String,
    /// Opaque content reference, passed through to the executor.
    pub baseline: serde_json::Value,
    pub status: JobStatus,
    pub requeue_on_failure: bool,
    pub created: DateTime<Utc>,
    pub finished: Option<DateTime<Utc>>,
    pub last_run_id: Option<usize>,
    pub runs: Vec<JobRun>,
}

impl Job {
    /// Create a new queued job.
    pub fn new(name: impl Into<String>, script: impl Into<String>, criteria: impl Into<String>) -> Self {
        Self {
            id: JobId::new(),
            name: name.into(),
            script: script.into(),
            criteria: criteria.into(),
            baseline: serde_json::Value::Null,
            status: JobStatus::Queued,
            requeue_on_failure: false,
            created: Utc::now(),
            finished: None,
            last_run_id: None,
            runs: Vec::new(),
        }
    }

    pub fn with_baseline(mut self, baseline: serde_json::Value) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn with_requeue_on_failure(mut self, requeue: bool) -> Self {
        self.requeue_on_failure = requeue;
        self
    }

    /// Parse this job's criteria.
    pub fn tag_criteria(&self) -> std::result::Result<TagCriteria, CriteriaError> {
        TagCriteria::parse(&self.criteria)
    }

    pub fn last_run(&self) -> Option<&JobRun> {
        self.last_run_id.and_then(|idx| self.runs.get(idx))
    }

    fn last_run_mut(&mut self) -> Result<&mut JobRun> {
        let id = self.id;
        self.last_run_id
            .and_then(|idx| self.runs.get_mut(idx))
            .ok_or_else(|| Error::Conflict(format!("job {} has no run", id)))
    }

    /// An executor was bound on `slave_id`: opens a new run.
    pub fn set_allocated(&mut self, slave_id: SlaveId) -> Result<()> {
        if self.status != JobStatus::Queued {
            return Err(Error::InvalidTransition(format!(
                "job {} cannot be allocated while {}",
                self.id, self.status
            )));
        }

        let index = self.runs.len();
        self.runs.push(JobRun {
            index,
            slave_id,
            log_id: None,
            allocated: Utc::now(),
            started: None,
            finished: None,
            status: JobStatus::Ongoing,
            artifacts: Vec::new(),
            logs: Vec::new(),
            revisions: Vec::new(),
            sub_jobs: Vec::new(),
        });
        self.last_run_id = Some(index);
        self.status = JobStatus::Ongoing;
        Ok(())
    }

    /// Remote execution began, writing to `log_id`.
    pub fn set_ongoing(&mut self, log_id: impl Into<String>) -> Result<()> {
        if self.status != JobStatus::Ongoing {
            return Err(Error::InvalidTransition(format!(
                "job {} cannot start while {}",
                self.id, self.status
            )));
        }
        let run = self.last_run_mut()?;
        run.log_id = Some(log_id.into());
        run.started = Some(Utc::now());
        Ok(())
    }

    /// The run ended with `result`.
    pub fn set_finished(&mut self, result: JobResult) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "job {} already finished as {}",
                self.id, self.status
            )));
        }

        let now = Utc::now();
        let status = JobStatus::from(result);
        if let Ok(run) = self.last_run_mut() {
            run.finished = Some(now);
            run.status = status;
        }
        self.status = status;
        self.finished = Some(now);
        Ok(())
    }

    /// Return the job to the queue after a worker failure.
    pub fn set_reset(&mut self) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidTransition(format!(
                "job {} cannot be requeued once {}",
                self.id, self.status
            )));
        }
        if let Ok(run) = self.last_run_mut() {
            run.finished = Some(Utc::now());
            run.status = JobStatus::Aborted;
        }
        self.status = JobStatus::Queued;
        self.finished = None;
        Ok(())
    }

    pub fn add_artifact(
        &mut self,
        name: impl Into<String>,
        repository: impl Into<String>,
        version: Option<String>,
        id: impl Into<String>,
    ) -> Result<()> {
        self.last_run_mut()?.artifacts.push(ArtifactRef {
            id: id.into(),
            name: name.into(),
            repository: repository.into(),
            version,
        });
        Ok(())
    }

    pub fn add_log(&mut self, name: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.last_run_mut()?.logs.push(LogRef {
            id: id.into(),
            name: name.into(),
        });
        Ok(())
    }

    pub fn add_revision(&mut self, id: impl Into<String>, state: impl Into<String>) -> Result<()> {
        self.last_run_mut()?.revisions.push(RevisionRef {
            id: id.into(),
            state: state.into(),
        });
        Ok(())
    }

    pub fn add_sub_job(&mut self, name: impl Into<String>, id: impl Into<String>) -> Result<()> {
        self.last_run_mut()?.sub_jobs.push(SubJobRef {
            id: id.into(),
            name: name.into(),
        });
        Ok(())
    }
}
