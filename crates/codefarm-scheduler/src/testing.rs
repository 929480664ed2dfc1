//! Scripted collaborators for scheduler tests.

use crate::callbacks::CallbackBroker;
use crate::control::{Scheduler, Stores};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use codefarm_config::SchedulerConfig;
use codefarm_core::callback::{CallbackReply, TypeName};
use codefarm_core::executor::{Executor, ExecutorFactory, ExecutorRecord, ExecutorState};
use codefarm_core::services::PlatformServices;
use codefarm_core::{
    Error, Event, EventBus, ExecutorId, InProcessBus, Job, JobId, Result, Slave, SlaveId,
};
use codefarm_db::{ExecutorRepo, JobRepo, MemExecutorRepo, MemJobRepo, MemSlaveRepo, SlaveRepo};
use serde_json::{Value, json};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;

/// A lifecycle call made on a mock executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Allocate {
        executor: ExecutorId,
        job: JobId,
        slave: SlaveId,
    },
    Start {
        executor: ExecutorId,
        job: JobId,
    },
    Abort(ExecutorId),
    Resume(ExecutorId),
    Detach(ExecutorId),
}

/// Shared between a factory and its executors: failure script and call log.
#[derive(Default)]
pub struct Recorder {
    calls: Mutex<Vec<Call>>,
    fail_allocate: Mutex<HashSet<String>>,
    fail_start: Mutex<HashSet<String>>,
    fail_resume: Mutex<bool>,
}

impl Recorder {
    fn push(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    /// `(job, slave)` of every allocate call, in order.
    pub fn allocations(&self) -> Vec<(JobId, SlaveId)> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Allocate { job, slave, .. } => Some((job, slave)),
                _ => None,
            })
            .collect()
    }

    pub fn starts(&self) -> Vec<JobId> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                Call::Start { job, .. } => Some(job),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| matches(call)).count()
    }

    /// Make `allocate` fail for jobs with this name.
    pub fn fail_allocate(&self, job_name: &str) {
        self.fail_allocate
            .lock()
            .unwrap()
            .insert(job_name.to_string());
    }

    /// Make `start` fail for jobs with this name.
    pub fn fail_start(&self, job_name: &str) {
        self.fail_start.lock().unwrap().insert(job_name.to_string());
    }

    pub fn fail_resume(&self) {
        *self.fail_resume.lock().unwrap() = true;
    }
}

/// Executor that records calls and publishes the events a real one would.
///
/// Like a real backend it keeps its record in the executor store while
/// active.
pub struct MockExecutor {
    record: Mutex<ExecutorRecord>,
    bus: Option<Arc<dyn EventBus>>,
    repo: Option<Arc<dyn ExecutorRepo>>,
    recorder: Arc<Recorder>,
    files: Mutex<HashMap<String, Bytes>>,
    replies: Mutex<Vec<CallbackReply>>,
    errors: Mutex<Vec<String>>,
}

impl MockExecutor {
    pub fn new(
        record: ExecutorRecord,
        bus: Option<Arc<dyn EventBus>>,
        repo: Option<Arc<dyn ExecutorRepo>>,
        recorder: Arc<Recorder>,
    ) -> Self {
        Self {
            record: Mutex::new(record),
            bus,
            repo,
            recorder,
            files: Mutex::new(HashMap::new()),
            replies: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// An executor wired to nothing.
    pub fn detached() -> Arc<Self> {
        Arc::new(Self::new(
            ExecutorRecord::new(ExecutorId::new()),
            None,
            None,
            Arc::new(Recorder::default()),
        ))
    }

    pub fn put_file(&self, path: &str, content: &str) {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), Bytes::from(content.to_string()));
    }

    pub fn replies(&self) -> Vec<CallbackReply> {
        self.replies.lock().unwrap().clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().unwrap().clone()
    }

    fn publish(&self, event: Event) {
        if let Some(bus) = &self.bus {
            bus.publish(event);
        }
    }

    async fn persist(&self, record: &ExecutorRecord) -> Result<()> {
        if let Some(repo) = &self.repo {
            repo.save(record)
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;
        }
        Ok(())
    }
}

#[async_trait]
impl Executor for MockExecutor {
    fn id(&self) -> ExecutorId {
        self.record.lock().unwrap().id
    }

    async fn record(&self) -> ExecutorRecord {
        self.record.lock().unwrap().clone()
    }

    async fn allocate(&self, job: &Job, slave: &Slave) -> Result<()> {
        self.recorder.push(Call::Allocate {
            executor: self.id(),
            job: job.id,
            slave: slave.id.clone(),
        });
        if self.recorder.fail_allocate.lock().unwrap().contains(&job.name) {
            return Err(Error::ExecutionFailed(format!("cannot allocate {}", job.name)));
        }
        let record = {
            let mut record = self.record.lock().unwrap();
            record.bind(job.id, slave.id.clone())?;
            record.clone()
        };
        self.persist(&record).await?;
        self.publish(Event::ExecutorAllocated { executor: record });
        Ok(())
    }

    async fn start(&self, job: &Job) -> Result<()> {
        self.recorder.push(Call::Start {
            executor: self.id(),
            job: job.id,
        });
        if self.recorder.fail_start.lock().unwrap().contains(&job.name) {
            return Err(Error::ExecutionFailed(format!("cannot start {}", job.name)));
        }
        let record = {
            let mut record = self.record.lock().unwrap();
            record.transition(ExecutorState::Started)?;
            record.log_id = Some(format!("log-{}", record.id));
            record.clone()
        };
        self.persist(&record).await?;
        self.publish(Event::ExecutorStarted { executor: record });
        Ok(())
    }

    async fn abort(&self) -> Result<()> {
        self.recorder.push(Call::Abort(self.id()));
        Ok(())
    }

    async fn resume(&self) -> Result<()> {
        self.recorder.push(Call::Resume(self.id()));
        if *self.recorder.fail_resume.lock().unwrap() {
            return Err(Error::Unavailable("slave unreachable".to_string()));
        }
        Ok(())
    }

    async fn detach(&self) -> Result<()> {
        self.recorder.push(Call::Detach(self.id()));
        Ok(())
    }

    async fn download_file(&self, path: &str) -> Result<Bytes> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    async fn notify_info(&self, reply: CallbackReply) -> Result<()> {
        self.replies.lock().unwrap().push(reply);
        Ok(())
    }

    async fn notify_error(&self, message: String) -> Result<()> {
        self.errors.lock().unwrap().push(message);
        Ok(())
    }
}

pub struct MockExecutorFactory {
    bus: Arc<dyn EventBus>,
    repo: Arc<dyn ExecutorRepo>,
    pub recorder: Arc<Recorder>,
}

impl MockExecutorFactory {
    pub fn new(bus: Arc<dyn EventBus>, repo: Arc<dyn ExecutorRepo>) -> Self {
        Self {
            bus,
            repo,
            recorder: Arc::new(Recorder::default()),
        }
    }
}

impl ExecutorFactory for MockExecutorFactory {
    fn create(&self) -> Arc<dyn Executor> {
        self.restore(ExecutorRecord::new(ExecutorId::new()))
    }

    fn restore(&self, record: ExecutorRecord) -> Arc<dyn Executor> {
        Arc::new(MockExecutor::new(
            record,
            Some(self.bus.clone()),
            Some(self.repo.clone()),
            self.recorder.clone(),
        ))
    }
}

/// Platform services that answer from memory and remember what they saw.
#[derive(Default)]
pub struct MockServices {
    created: Mutex<Vec<Value>>,
    uploads: Mutex<Vec<(String, String, Bytes)>>,
    merged: Mutex<Vec<String>>,
    failure: Mutex<Option<String>>,
}

impl MockServices {
    pub fn fail_with(&self, message: &str) {
        *self.failure.lock().unwrap() = Some(message.to_string());
    }

    pub fn created(&self) -> Vec<Value> {
        self.created.lock().unwrap().clone()
    }

    /// `(type, id, content)` of every upload.
    pub fn uploads(&self) -> Vec<(String, String, Bytes)> {
        self.uploads.lock().unwrap().clone()
    }

    pub fn merged(&self) -> Vec<String> {
        self.merged.lock().unwrap().clone()
    }

    fn check(&self) -> Result<()> {
        match self.failure.lock().unwrap().clone() {
            Some(message) => Err(Error::ExecutionFailed(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl PlatformServices for MockServices {
    async fn read_type(
        &self,
        type_name: &TypeName,
        id: Option<&str>,
        getter: Option<&str>,
    ) -> Result<Value> {
        self.check()?;
        Ok(json!({ "type": type_name.to_string(), "_id": id, "getter": getter }))
    }

    async fn create_type(&self, _type_name: &TypeName, data: Value) -> Result<Value> {
        self.check()?;
        let mut created = self.created.lock().unwrap();
        created.push(data.clone());
        let mut object = data;
        if let Value::Object(fields) = &mut object {
            fields.insert("_id".to_string(), json!(format!("id-{}", created.len())));
        }
        Ok(object)
    }

    async fn update_type(&self, _type_name: &TypeName, id: &str, data: Value) -> Result<Value> {
        self.check()?;
        Ok(json!({ "_id": id, "data": data }))
    }

    async fn type_action(
        &self,
        _type_name: &TypeName,
        id: &str,
        action: &str,
        _data: Value,
    ) -> Result<Value> {
        self.check()?;
        Ok(json!({ "_id": id, "action": action }))
    }

    async fn upload_file(&self, target: &TypeName, id: &str, content: Bytes) -> Result<Value> {
        self.check()?;
        self.uploads
            .lock()
            .unwrap()
            .push((target.to_string(), id.to_string(), content));
        Ok(json!({ "_id": id, "name": format!("upload-{}", id) }))
    }

    async fn merge_revision(&self, revision_id: &str) -> Result<Value> {
        self.check()?;
        self.merged.lock().unwrap().push(revision_id.to_string());
        Ok(json!({ "_id": revision_id }))
    }

    async fn allocate_log(&self, name: &str, _tags: &[String]) -> Result<String> {
        self.check()?;
        Ok(format!("log-{}", name))
    }
}

/// A scheduler over in-memory stores and mock collaborators.
pub struct Farm {
    pub bus: Arc<InProcessBus>,
    pub jobs: Arc<MemJobRepo>,
    pub slaves: Arc<MemSlaveRepo>,
    pub executors: Arc<MemExecutorRepo>,
    pub recorder: Arc<Recorder>,
    pub services: Arc<MockServices>,
    pub scheduler: Arc<Scheduler>,
}

impl Farm {
    pub fn new() -> Self {
        Self::with_config(SchedulerConfig::default())
    }

    pub fn with_config(config: SchedulerConfig) -> Self {
        let bus = Arc::new(InProcessBus::new(config.event_capacity));
        let jobs = Arc::new(MemJobRepo::new(bus.clone()));
        let slaves = Arc::new(MemSlaveRepo::new(bus.clone()));
        let executors = Arc::new(MemExecutorRepo::new());
        let factory = MockExecutorFactory::new(bus.clone(), executors.clone());
        let recorder = factory.recorder.clone();
        let services = Arc::new(MockServices::default());

        let scheduler = Arc::new(Scheduler::new(
            Stores {
                jobs: jobs.clone(),
                slaves: slaves.clone(),
                executors: executors.clone(),
            },
            Arc::new(factory),
            services.clone(),
            bus.clone(),
            config,
        ));

        Self {
            bus,
            jobs,
            slaves,
            executors,
            recorder,
            services,
            scheduler,
        }
    }

    pub fn broker(&self) -> CallbackBroker {
        CallbackBroker::new(self.jobs.clone(), self.services.clone())
    }

    pub async fn slave(&self, id: &str, tags: &[&str], executors: usize) -> Slave {
        let tags = tags.iter().map(|t| t.to_string()).collect();
        let slave = Slave::new(id, Url::parse("local://localhost").unwrap(), tags, executors);
        self.slaves.create(slave).await.unwrap()
    }

    pub async fn job(&self, name: &str, criteria: &str) -> Job {
        self.jobs
            .create(Job::new(name, "true", criteria))
            .await
            .unwrap()
    }

    /// Queue a job with an explicit creation time.
    pub async fn job_created_at(&self, name: &str, criteria: &str, created: DateTime<Utc>) -> Job {
        let mut job = Job::new(name, "true", criteria);
        job.created = created;
        self.jobs.create(job).await.unwrap()
    }

    pub async fn requeuing_job(&self, name: &str, criteria: &str) -> Job {
        self.jobs
            .create(Job::new(name, "true", criteria).with_requeue_on_failure(true))
            .await
            .unwrap()
    }

    /// Executor currently bound to `job_id`.
    pub async fn executor_for(&self, job_id: JobId) -> ExecutorRecord {
        let binding = self
            .scheduler
            .bindings()
            .await
            .into_iter()
            .find(|b| b.job_id == Some(job_id))
            .expect("job has no executor");
        let mut record = ExecutorRecord::new(binding.executor_id);
        record.bind(job_id, binding.slave_id.expect("executor has no slave")).unwrap();
        record
    }
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {}", what);
}
