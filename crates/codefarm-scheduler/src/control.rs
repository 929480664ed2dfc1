//! The scheduler: allocates queued jobs to slaves and follows their executors.

use crate::callbacks::CallbackBroker;
use crate::error::{SchedulerError, SchedulerResult};
use crate::pool::{Binding, ExecutorPool};
use codefarm_config::SchedulerConfig;
use codefarm_core::callback::CallbackRequest;
use codefarm_core::events::Subscription;
use codefarm_core::executor::{Executor, ExecutorFactory, ExecutorRecord};
use codefarm_core::services::PlatformServices;
use codefarm_core::{
    Event, EventBus, ExecutorId, Job, JobId, JobResult, Slave, SlaveId, TagCriteria,
};
use codefarm_db::{DbError, DbResult, ExecutorRepo, JobRepo, SlaveRepo};
use futures::future::join_all;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Mutex;
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, instrument, warn};

/// The stores a scheduler reads and mutates.
pub struct Stores {
    pub jobs: Arc<dyn JobRepo>,
    pub slaves: Arc<dyn SlaveRepo>,
    pub executors: Arc<dyn ExecutorRepo>,
}

/// Outcome of one allocation attempt.
pub enum Allocation {
    /// No queued job is eligible.
    NoJob,
    /// The top candidate fits no online slave with a free slot.
    NoSlave { job: Job },
    /// An executor was allocated for the job.
    Bound {
        job: Job,
        executor: Arc<dyn Executor>,
    },
    /// The executor refused the allocation and was discarded.
    Failed {
        job: Job,
        error: codefarm_core::Error,
    },
}

impl std::fmt::Debug for Allocation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Allocation::NoJob => write!(f, "NoJob"),
            Allocation::NoSlave { job } => write!(f, "NoSlave({})", job.id),
            Allocation::Bound { job, executor } => {
                write!(f, "Bound({} on {})", job.id, executor.id())
            }
            Allocation::Failed { job, error } => write!(f, "Failed({}: {})", job.id, error),
        }
    }
}

/// Counters for one scheduling pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassStats {
    pub started: usize,
    pub start_failures: usize,
    pub allocation_errors: usize,
}

/// Matches queued jobs to slaves and drives job state from executor events.
///
/// The executor pool is owned here; nothing else mutates it. Scheduling
/// passes are serialized so that a slot read as free is reserved before
/// any other pass can read it.
pub struct Scheduler {
    pub(crate) jobs: Arc<dyn JobRepo>,
    pub(crate) slaves: Arc<dyn SlaveRepo>,
    executors: Arc<dyn ExecutorRepo>,
    factory: Arc<dyn ExecutorFactory>,
    pub(crate) bus: Arc<dyn EventBus>,
    broker: CallbackBroker,
    pub(crate) config: SchedulerConfig,
    pool: Mutex<ExecutorPool>,
    pass_lock: Mutex<()>,
    pass_pending: AtomicBool,
    disposed: AtomicBool,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(
        stores: Stores,
        factory: Arc<dyn ExecutorFactory>,
        services: Arc<dyn PlatformServices>,
        bus: Arc<dyn EventBus>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            broker: CallbackBroker::new(stores.jobs.clone(), services),
            jobs: stores.jobs,
            slaves: stores.slaves,
            executors: stores.executors,
            factory,
            bus,
            config,
            pool: Mutex::new(ExecutorPool::new()),
            pass_lock: Mutex::new(()),
            pass_pending: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            listener: Mutex::new(None),
        }
    }

    /// Subscribe to the bus, resume persisted executors and run a first pass.
    pub async fn start(self: &Arc<Self>) -> SchedulerResult<()> {
        self.disposed.store(false, Ordering::SeqCst);
        let events = self.bus.subscribe();
        let listener = tokio::spawn(Arc::clone(self).listen(events));
        if let Some(previous) = self.listener.lock().await.replace(listener) {
            previous.abort();
        }

        let records = self.executors.find_active().await?;
        info!(count = records.len(), "Resuming executors");
        for record in records {
            let executor = self.factory.restore(record.clone());
            self.pool
                .lock()
                .await
                .insert(executor.clone(), record.job_id, record.slave_id.clone());
            if let Err(e) = executor.resume().await {
                error!(executor_id = %record.id, error = %e, "Failed to resume executor");
            }
        }

        let stats = self.run_scheduling_pass().await?;
        info!(started = stats.started, "Scheduler started");
        Ok(())
    }

    /// Stop listening and detach every pooled executor without aborting it.
    pub async fn dispose(&self) {
        self.disposed.store(true, Ordering::SeqCst);
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }

        let _pass = self.pass_lock.lock().await;
        let executors = self.pool.lock().await.drain();
        info!(count = executors.len(), "Detaching executors");
        let results = join_all(executors.iter().map(|executor| executor.detach())).await;
        for (executor, result) in executors.iter().zip(results) {
            if let Err(e) = result {
                warn!(executor_id = %executor.id(), error = %e, "Failed to detach executor");
            }
        }
    }

    /// Current pool contents.
    pub async fn bindings(&self) -> Vec<Binding> {
        self.pool.lock().await.bindings()
    }

    /// Try to bind the newest eligible queued job to a slave.
    pub async fn allocate_one(&self, exclude: &[JobId]) -> SchedulerResult<Allocation> {
        let _pass = self.pass_lock.lock().await;
        self.try_allocate(exclude).await
    }

    /// Allocate and start jobs until the top candidate cannot be placed.
    pub async fn run_scheduling_pass(&self) -> SchedulerResult<PassStats> {
        let _pass = self.pass_lock.lock().await;
        self.pass_locked().await
    }

    /// Request a pass without waiting for it. Requests made while one is
    /// already waiting for the lock are folded into it.
    fn trigger_pass(self: &Arc<Self>) {
        if self.pass_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        let scheduler = Arc::clone(self);
        tokio::spawn(async move {
            let _pass = scheduler.pass_lock.lock().await;
            scheduler.pass_pending.store(false, Ordering::SeqCst);
            if let Err(e) = scheduler.pass_locked().await {
                error!(error = %e, "Scheduling pass failed");
            }
        });
    }

    #[instrument(skip(self))]
    async fn pass_locked(&self) -> SchedulerResult<PassStats> {
        let mut stats = PassStats::default();
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(stats);
        }

        let mut exclude = Vec::new();
        loop {
            match self.try_allocate(&exclude).await? {
                Allocation::NoJob => {
                    debug!("No queued job to schedule");
                    break;
                }
                Allocation::NoSlave { job } => {
                    debug!(job_id = %job.id, criteria = %job.criteria, "No slave available for job");
                    break;
                }
                Allocation::Failed { job, .. } => {
                    stats.allocation_errors += 1;
                    exclude.push(job.id);
                }
                Allocation::Bound { job, executor } => match executor.start(&job).await {
                    Ok(()) => {
                        info!(job_id = %job.id, executor_id = %executor.id(), "Started job");
                        stats.started += 1;
                    }
                    Err(e) => {
                        // The job keeps its executor; nothing retries it.
                        error!(job_id = %job.id, executor_id = %executor.id(), error = %e, "Failed to start job");
                        stats.start_failures += 1;
                    }
                },
            }
        }

        Ok(stats)
    }

    async fn try_allocate(&self, exclude: &[JobId]) -> SchedulerResult<Allocation> {
        let queued = self.jobs.find_queued(exclude).await?;
        let candidate = {
            let pool = self.pool.lock().await;
            newest_unbound(queued, &pool)
        };
        let Some(job) = candidate else {
            return Ok(Allocation::NoJob);
        };

        let criteria = match job.tag_criteria() {
            Ok(criteria) => criteria,
            Err(e) => {
                warn!(job_id = %job.id, criteria = %job.criteria, error = %e, "Job criteria cannot match any slave");
                return Ok(Allocation::NoSlave { job });
            }
        };

        let online = self.slaves.list_online().await?;
        let (executor, slave) = {
            let mut pool = self.pool.lock().await;
            let Some(slave) = least_utilized(online, &pool, &criteria) else {
                return Ok(Allocation::NoSlave { job });
            };
            let executor = self.factory.create();
            pool.insert(executor.clone(), Some(job.id), Some(slave.id.clone()));
            (executor, slave)
        };

        if let Err(error) = executor.allocate(&job, &slave).await {
            error!(job_id = %job.id, slave_id = %slave.id, error = %error, "Failed to allocate executor");
            self.pool.lock().await.remove(executor.id());
            return Ok(Allocation::Failed { job, error });
        }

        debug!(job_id = %job.id, slave_id = %slave.id, executor_id = %executor.id(), "Allocated executor");
        Ok(Allocation::Bound { job, executor })
    }

    async fn listen(self: Arc<Self>, mut events: Subscription) {
        loop {
            match events.recv().await {
                Ok(event) => self.handle_event(event).await,
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Scheduler fell behind the event bus");
                    let scheduler = Arc::clone(&self);
                    tokio::spawn(async move {
                        if let Err(e) = scheduler.reconcile().await {
                            error!(error = %e, "Failed to reconcile executor pool");
                        }
                        scheduler.trigger_pass();
                    });
                }
                Err(RecvError::Closed) => {
                    debug!("Event bus closed");
                    break;
                }
            }
        }
    }

    /// Rebuild the pool from the executor store after missed events.
    ///
    /// Entries without an active record are dropped. Executors whose job or
    /// slave no longer exists are aborted.
    async fn reconcile(&self) -> SchedulerResult<()> {
        let _pass = self.pass_lock.lock().await;
        if self.disposed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let active: HashSet<ExecutorId> = self
            .executors
            .find_active()
            .await?
            .into_iter()
            .map(|record| record.id)
            .collect();

        let mut stale = 0;
        let mut orphaned = Vec::new();
        for binding in self.bindings().await {
            if !active.contains(&binding.executor_id) {
                self.pool.lock().await.remove(binding.executor_id);
                stale += 1;
                continue;
            }
            let job_gone = match binding.job_id {
                Some(job_id) => is_missing(self.jobs.get(job_id).await)?,
                None => false,
            };
            let slave_gone = match &binding.slave_id {
                Some(slave_id) => is_missing(self.slaves.get(slave_id).await)?,
                None => false,
            };
            if job_gone || slave_gone {
                if let Some(executor) = self.pool.lock().await.remove(binding.executor_id) {
                    orphaned.push(executor);
                }
            }
        }

        info!(stale, orphaned = orphaned.len(), "Reconciled executor pool");
        for executor in orphaned {
            self.abort_executor(executor).await;
        }
        Ok(())
    }

    async fn handle_event(self: &Arc<Self>, event: Event) {
        let topic = event.topic();
        let result = match event {
            Event::SlaveCreated { .. }
            | Event::SlaveTagged { .. }
            | Event::SlaveUntagged { .. }
            | Event::SlaveOnline { .. }
            | Event::JobCreated { .. }
            | Event::JobRequeued { .. } => {
                self.trigger_pass();
                Ok(())
            }
            Event::SlaveOffline { slave } => {
                self.abort_on_slave(&slave.id).await;
                Ok(())
            }
            Event::SlaveRemoved { slave_id } => {
                self.abort_on_slave(&slave_id).await;
                Ok(())
            }
            Event::JobRemoved { job_id } => {
                self.abort_job(job_id).await;
                Ok(())
            }
            Event::ExecutorRemoved { executor } => {
                self.pool.lock().await.remove(executor.id);
                self.trigger_pass();
                Ok(())
            }
            Event::ExecutorAllocated { executor } => self.on_allocated(&executor).await,
            Event::ExecutorStarted { executor } => self.on_started(&executor).await,
            Event::ExecutorFinished { executor, result } => {
                self.on_finished(&executor, result).await
            }
            Event::ExecutorFailure { executor } => self.on_failure(&executor).await,
            Event::ExecutorCallback { executor, request } => {
                self.dispatch_callback(executor, request).await;
                Ok(())
            }
            Event::SlaveUpdated { .. } | Event::JobUpdated { .. } => Ok(()),
        };

        if let Err(e) = result {
            error!(topic, error = %e, "Failed to handle event");
        }
    }

    async fn on_allocated(&self, record: &ExecutorRecord) -> SchedulerResult<()> {
        let (job_id, slave_id) = bound(record)?;
        self.jobs
            .update(job_id, Box::new(move |job: &mut Job| job.set_allocated(slave_id)))
            .await?;
        Ok(())
    }

    async fn on_started(&self, record: &ExecutorRecord) -> SchedulerResult<()> {
        let (job_id, _) = bound(record)?;
        let log_id = record
            .log_id
            .clone()
            .unwrap_or_else(|| record.id.to_string());
        self.jobs
            .update(job_id, Box::new(move |job: &mut Job| job.set_ongoing(log_id)))
            .await?;
        Ok(())
    }

    async fn on_finished(&self, record: &ExecutorRecord, result: JobResult) -> SchedulerResult<()> {
        let (job_id, _) = bound(record)?;
        self.jobs
            .update(job_id, Box::new(move |job: &mut Job| job.set_finished(result)))
            .await?;
        info!(job_id = %job_id, %result, "Job finished");
        Ok(())
    }

    /// Take the slave out of rotation, then requeue or abort the job.
    async fn on_failure(&self, record: &ExecutorRecord) -> SchedulerResult<()> {
        let (job_id, slave_id) = bound(record)?;

        match self.slaves.get(&slave_id).await {
            Ok(mut slave) => {
                slave.offline = true;
                self.slaves.save(&slave).await?;
                warn!(slave_id = %slave_id, executor_id = %record.id, "Slave marked offline after executor failure");
            }
            Err(e) => {
                warn!(slave_id = %slave_id, error = %e, "Failed slave is no longer registered");
            }
        }

        let job = self.jobs.get(job_id).await?;
        if job.requeue_on_failure {
            let job = self
                .jobs
                .update(job_id, Box::new(|job: &mut Job| job.set_reset()))
                .await?;
            info!(job_id = %job_id, "Requeued job after executor failure");
            self.bus.publish(Event::JobRequeued { job });
        } else {
            self.jobs
                .update(job_id, Box::new(|job: &mut Job| job.set_finished(JobResult::Aborted)))
                .await?;
            info!(job_id = %job_id, "Aborted job after executor failure");
        }
        Ok(())
    }

    async fn abort_on_slave(&self, slave_id: &SlaveId) {
        let executors = self.pool.lock().await.take_on_slave(slave_id);
        for executor in executors {
            self.abort_executor(executor).await;
        }
    }

    async fn abort_job(&self, job_id: JobId) {
        let executor = self.pool.lock().await.take_for_job(job_id);
        if let Some(executor) = executor {
            self.abort_executor(executor).await;
        }
    }

    async fn abort_executor(&self, executor: Arc<dyn Executor>) {
        info!(executor_id = %executor.id(), "Aborting executor");
        if let Err(e) = executor.abort().await {
            error!(executor_id = %executor.id(), error = %e, "Failed to abort executor");
        }
    }

    async fn dispatch_callback(&self, record: ExecutorRecord, request: CallbackRequest) {
        let executor = self.pool.lock().await.get(record.id);
        let Some(executor) = executor else {
            warn!(executor_id = %record.id, topic = request.topic(), "Callback from unknown executor ignored");
            return;
        };

        let broker = self.broker.clone();
        tokio::spawn(async move {
            broker.handle(executor.as_ref(), &record, request).await;
        });
    }
}

/// `Ok(true)` when the store no longer holds the record.
fn is_missing<T>(lookup: DbResult<T>) -> SchedulerResult<bool> {
    match lookup {
        Ok(_) => Ok(false),
        Err(DbError::NotFound(_)) => Ok(true),
        Err(e) => Err(e.into()),
    }
}

fn bound(record: &ExecutorRecord) -> SchedulerResult<(JobId, SlaveId)> {
    match (record.job_id, record.slave_id.clone()) {
        (Some(job_id), Some(slave_id)) => Ok((job_id, slave_id)),
        _ => Err(SchedulerError::Unbound(record.id)),
    }
}

/// Most recently created job that has no executor yet.
fn newest_unbound(mut jobs: Vec<Job>, pool: &ExecutorPool) -> Option<Job> {
    jobs.retain(|job| !pool.is_job_bound(job.id));
    jobs.sort_by(|a, b| b.created.cmp(&a.created));
    jobs.into_iter().next()
}

/// Slave with the most free slots among those matching `criteria`.
///
/// Ties keep registry order.
fn least_utilized(slaves: Vec<Slave>, pool: &ExecutorPool, criteria: &TagCriteria) -> Option<Slave> {
    let mut slaves: Vec<(usize, Slave)> = slaves
        .into_iter()
        .map(|slave| {
            let free = slave
                .executors
                .saturating_sub(pool.count_on_slave(&slave.id));
            (free, slave)
        })
        .collect();
    slaves.sort_by(|a, b| b.0.cmp(&a.0));
    slaves
        .into_iter()
        .find(|(free, slave)| *free > 0 && slave.matches(criteria))
        .map(|(_, slave)| slave)
}
