//! Local process executor implementation.

use async_trait::async_trait;
use bytes::Bytes;
use codefarm_core::callback::CallbackReply;
use codefarm_core::executor::{Executor, ExecutorFactory, ExecutorRecord, ExecutorState};
use codefarm_core::{Error, Event, EventBus, ExecutorId, Job, JobResult, Result, Slave};
use codefarm_db::ExecutorRepo;
use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Name of the combined stdout/stderr file inside a run directory.
pub const OUTPUT_FILE: &str = "output.log";

/// Builds [`LocalExecutor`]s sharing one bus, record store and work directory.
pub struct LocalExecutorFactory {
    bus: Arc<dyn EventBus>,
    repo: Arc<dyn ExecutorRepo>,
    work_dir: PathBuf,
    shell: String,
}

impl LocalExecutorFactory {
    pub fn new(
        bus: Arc<dyn EventBus>,
        repo: Arc<dyn ExecutorRepo>,
        work_dir: impl Into<PathBuf>,
        shell: impl Into<String>,
    ) -> Self {
        Self {
            bus,
            repo,
            work_dir: work_dir.into(),
            shell: shell.into(),
        }
    }

    fn build(&self, record: ExecutorRecord) -> Arc<dyn Executor> {
        Arc::new(LocalExecutor::new(
            record,
            self.bus.clone(),
            self.repo.clone(),
            &self.work_dir,
            &self.shell,
        ))
    }
}

impl ExecutorFactory for LocalExecutorFactory {
    fn create(&self) -> Arc<dyn Executor> {
        self.build(ExecutorRecord::new(ExecutorId::new()))
    }

    fn restore(&self, record: ExecutorRecord) -> Arc<dyn Executor> {
        self.build(record)
    }
}

/// Runs a job's script with `<shell> -c` on the scheduler host.
///
/// Only slaves with a `local://` URI can be served. Each run gets its own
/// directory `<work-dir>/<executor id>`.
pub struct LocalExecutor {
    id: ExecutorId,
    inner: Arc<Inner>,
    run: Mutex<Option<Run>>,
}

struct Inner {
    record: Mutex<ExecutorRecord>,
    bus: Arc<dyn EventBus>,
    repo: Arc<dyn ExecutorRepo>,
    run_dir: PathBuf,
    shell: String,
}

/// Handle on a spawned job process.
struct Run {
    kill: oneshot::Sender<()>,
    monitor: JoinHandle<()>,
}

enum Outcome {
    Finished(JobResult),
    Failed,
}

impl LocalExecutor {
    pub fn new(
        record: ExecutorRecord,
        bus: Arc<dyn EventBus>,
        repo: Arc<dyn ExecutorRepo>,
        work_dir: &Path,
        shell: &str,
    ) -> Self {
        Self {
            id: record.id,
            inner: Arc::new(Inner {
                run_dir: work_dir.join(record.id.to_string()),
                record: Mutex::new(record),
                bus,
                repo,
                shell: shell.to_string(),
            }),
            run: Mutex::new(None),
        }
    }

    /// Directory the job script runs in.
    pub fn run_dir(&self) -> &Path {
        &self.inner.run_dir
    }

    fn spawn_process(&self, job: &Job, record: &ExecutorRecord, log: std::fs::File) -> Result<Child> {
        let stderr = log
            .try_clone()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to open job output: {}", e)))?;
        let slave_id = record
            .slave_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_default();

        Command::new(&self.inner.shell)
            .arg("-c")
            .arg(&job.script)
            .current_dir(&self.inner.run_dir)
            .env("CF_JOB_ID", job.id.to_string())
            .env("CF_JOB_NAME", &job.name)
            .env("CF_SLAVE_ID", slave_id)
            .env("CF_EXECUTOR_ID", self.id.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(stderr))
            .spawn()
            .map_err(|e| Error::ExecutionFailed(format!("Failed to spawn job process: {}", e)))
    }
}

impl Inner {
    async fn persist(&self, record: &ExecutorRecord) -> Result<()> {
        self.repo
            .save(record)
            .await
            .map_err(|e| Error::Internal(e.to_string()))
    }

    /// Move to a terminal state, announce it and drop the persisted record.
    ///
    /// Does nothing when the executor is already terminal.
    async fn conclude(&self, outcome: Outcome) {
        let next = match outcome {
            Outcome::Finished(JobResult::Aborted) => ExecutorState::Aborted,
            Outcome::Finished(_) => ExecutorState::Finished,
            Outcome::Failed => ExecutorState::Failed,
        };
        let record = {
            let mut record = self.record.lock().await;
            if let Err(e) = record.transition(next) {
                debug!(executor_id = %record.id, error = %e, "Executor already concluded");
                return;
            }
            record.clone()
        };

        match outcome {
            Outcome::Finished(result) => self.bus.publish(Event::ExecutorFinished {
                executor: record.clone(),
                result,
            }),
            Outcome::Failed => self.bus.publish(Event::ExecutorFailure {
                executor: record.clone(),
            }),
        }

        if let Err(e) = self.repo.remove(record.id).await {
            warn!(executor_id = %record.id, error = %e, "Failed to remove executor record");
        }
        self.bus.publish(Event::ExecutorRemoved { executor: record });
    }
}

async fn monitor(inner: Arc<Inner>, mut child: Child, kill: oneshot::Receiver<()>) {
    // `None` means a kill was requested before the process exited.
    let exited = tokio::select! {
        status = child.wait() => Some(status),
        Ok(()) = kill => None,
    };

    match exited {
        Some(Ok(status)) => {
            let result = if status.success() {
                JobResult::Success
            } else {
                JobResult::Fail
            };
            info!(run_dir = %inner.run_dir.display(), code = ?status.code(), %result, "Job process exited");
            inner.conclude(Outcome::Finished(result)).await;
        }
        Some(Err(e)) => {
            error!(run_dir = %inner.run_dir.display(), error = %e, "Lost track of job process");
            inner.conclude(Outcome::Failed).await;
        }
        None => {
            if let Err(e) = child.kill().await {
                warn!(run_dir = %inner.run_dir.display(), error = %e, "Failed to kill job process");
            }
            inner.conclude(Outcome::Finished(JobResult::Aborted)).await;
        }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    fn id(&self) -> ExecutorId {
        self.id
    }

    async fn record(&self) -> ExecutorRecord {
        self.inner.record.lock().await.clone()
    }

    async fn allocate(&self, job: &Job, slave: &Slave) -> Result<()> {
        if slave.uri.scheme() != "local" {
            return Err(Error::InvalidInput(format!(
                "slave {} is not reachable by the local executor: {}",
                slave.id, slave.uri
            )));
        }

        let record = {
            let mut record = self.inner.record.lock().await;
            record.bind(job.id, slave.id.clone())?;
            record.clone()
        };
        self.inner.persist(&record).await?;

        debug!(executor_id = %self.id, job_id = %job.id, slave_id = %slave.id, "Executor allocated");
        self.inner
            .bus
            .publish(Event::ExecutorAllocated { executor: record });
        Ok(())
    }

    async fn start(&self, job: &Job) -> Result<()> {
        tokio::fs::create_dir_all(&self.inner.run_dir)
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to create run directory: {}", e)))?;
        let log = tokio::fs::File::create(self.inner.run_dir.join(OUTPUT_FILE))
            .await
            .map_err(|e| Error::ExecutionFailed(format!("Failed to open job output: {}", e)))?
            .into_std()
            .await;

        let mut run = self.run.lock().await;
        let previous = self.inner.record.lock().await.clone();
        let mut record = previous.clone();
        record.transition(ExecutorState::Started)?;
        record.log_id = Some(format!("{}.log", self.id));

        // Persisted before spawning so a running process always has a record.
        self.inner.persist(&record).await?;
        let child = match self.spawn_process(job, &record, log) {
            Ok(child) => child,
            Err(e) => {
                if let Err(rollback) = self.inner.persist(&previous).await {
                    warn!(executor_id = %self.id, error = %rollback, "Failed to restore executor record");
                }
                return Err(e);
            }
        };
        *self.inner.record.lock().await = record.clone();

        info!(executor_id = %self.id, job_id = %job.id, pid = ?child.id(), "Job process started");
        self.inner
            .bus
            .publish(Event::ExecutorStarted { executor: record });

        let (kill, kill_rx) = oneshot::channel();
        let monitor = tokio::spawn(monitor(self.inner.clone(), child, kill_rx));
        *run = Some(Run { kill, monitor });
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        match self.run.lock().await.take() {
            Some(run) => {
                if run.kill.send(()).is_err() {
                    debug!(executor_id = %self.id, "Job process already exited");
                }
            }
            None => {
                self.inner
                    .conclude(Outcome::Finished(JobResult::Aborted))
                    .await;
            }
        }
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        // A process from an earlier scheduler cannot be reattached.
        warn!(executor_id = %self.id, "Local run cannot be resumed, reporting failure");
        self.inner.conclude(Outcome::Failed).await;
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        if let Some(run) = self.run.lock().await.take() {
            run.monitor.abort();
        }
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Bytes> {
        let relative = Path::new(path);
        let escapes = relative.components().any(|c| {
            matches!(
                c,
                Component::ParentDir | Component::RootDir | Component::Prefix(_)
            )
        });
        if escapes {
            return Err(Error::InvalidInput(format!(
                "path must stay inside the run directory: {}",
                path
            )));
        }

        let content = tokio::fs::read(self.inner.run_dir.join(relative))
            .await
            .map_err(|e| Error::NotFound(format!("{}: {}", path, e)))?;
        Ok(Bytes::from(content))
    }

    async fn notify_info(&self, reply: CallbackReply) -> Result<()> {
        info!(executor_id = %self.id, kind = %reply.kind, "Callback answered");
        Ok(())
    }

    async fn notify_error(&self, message: String) -> Result<()> {
        warn!(executor_id = %self.id, error = %message, "Callback failed");
        Ok(())
    }
}
