//! Job repository.

use async_trait::async_trait;
use codefarm_core::{Event, EventBus, Job, JobId, JobStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{DbError, DbResult};

/// A change applied to a stored job under the store's lock.
pub type JobMutation = Box<dyn FnOnce(&mut Job) -> codefarm_core::Result<()> + Send>;

#[async_trait]
pub trait JobRepo: Send + Sync {
    /// Store a new job and announce it (`job.created`).
    async fn create(&self, job: Job) -> DbResult<Job>;
    async fn get(&self, id: JobId) -> DbResult<Job>;
    async fn list(&self) -> DbResult<Vec<Job>>;
    /// Queued jobs whose id is not in `exclude`, in creation order.
    async fn find_queued(&self, exclude: &[JobId]) -> DbResult<Vec<Job>>;
    /// Persist changes to an existing job (`job.updated`).
    async fn save(&self, job: &Job) -> DbResult<()>;
    /// Read-modify-write a job atomically (`job.updated` on success).
    async fn update(&self, id: JobId, mutation: JobMutation) -> DbResult<Job>;
    /// Delete a job (`job.removed`).
    async fn remove(&self, id: JobId) -> DbResult<()>;
}

/// In-memory implementation of JobRepo.
///
/// Ids are UUIDv7, so the map iterates in creation order.
pub struct MemJobRepo {
    jobs: RwLock<BTreeMap<JobId, Job>>,
    bus: Arc<dyn EventBus>,
}

impl MemJobRepo {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            jobs: RwLock::new(BTreeMap::new()),
            bus,
        }
    }
}

#[async_trait]
impl JobRepo for MemJobRepo {
    async fn create(&self, job: Job) -> DbResult<Job> {
        {
            let mut jobs = self.jobs.write().await;
            if jobs.contains_key(&job.id) {
                return Err(DbError::Duplicate(format!("job {}", job.id)));
            }
            jobs.insert(job.id, job.clone());
        }
        debug!(job_id = %job.id, name = %job.name, "Job created");
        self.bus.publish(Event::JobCreated { job: job.clone() });
        Ok(job)
    }

    async fn get(&self, id: JobId) -> DbResult<Job> {
        self.jobs
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn list(&self) -> DbResult<Vec<Job>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn find_queued(&self, exclude: &[JobId]) -> DbResult<Vec<Job>> {
        Ok(self
            .jobs
            .read()
            .await
            .values()
            .filter(|job| job.status == JobStatus::Queued && !exclude.contains(&job.id))
            .cloned()
            .collect())
    }

    async fn save(&self, job: &Job) -> DbResult<()> {
        {
            let mut jobs = self.jobs.write().await;
            match jobs.get_mut(&job.id) {
                Some(stored) => *stored = job.clone(),
                None => return Err(DbError::NotFound(format!("job {}", job.id))),
            }
        }
        self.bus.publish(Event::JobUpdated { job: job.clone() });
        Ok(())
    }

    async fn update(&self, id: JobId, mutation: JobMutation) -> DbResult<Job> {
        let job = {
            let mut jobs = self.jobs.write().await;
            let stored = jobs
                .get_mut(&id)
                .ok_or_else(|| DbError::NotFound(format!("job {}", id)))?;
            let mut draft = stored.clone();
            mutation(&mut draft)?;
            *stored = draft.clone();
            draft
        };
        self.bus.publish(Event::JobUpdated { job: job.clone() });
        Ok(job)
    }

    async fn remove(&self, id: JobId) -> DbResult<()> {
        if self.jobs.write().await.remove(&id).is_none() {
            return Err(DbError::NotFound(format!("job {}", id)));
        }
        debug!(job_id = %id, "Job removed");
        self.bus.publish(Event::JobRemoved { job_id: id });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codefarm_core::InProcessBus;

    fn repo() -> (MemJobRepo, codefarm_core::events::Subscription) {
        let bus = Arc::new(InProcessBus::new(16));
        let rx = bus.subscribe();
        (MemJobRepo::new(bus), rx)
    }

    #[tokio::test]
    async fn test_create_publishes_event() {
        let (repo, mut rx) = repo();
        let job = repo.create(Job::new("build", "make", "")).await.unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event, Event::JobCreated { job: job.clone() });
        assert_eq!(repo.get(job.id).await.unwrap(), job);
    }

    #[tokio::test]
    async fn test_duplicate_create_is_rejected() {
        let (repo, _rx) = repo();
        let job = repo.create(Job::new("build", "make", "")).await.unwrap();
        assert!(matches!(
            repo.create(job).await,
            Err(DbError::Duplicate(_))
        ));
    }

    #[tokio::test]
    async fn test_find_queued_filters_status_and_exclusions() {
        let (repo, _rx) = repo();
        let a = repo.create(Job::new("a", "", "")).await.unwrap();
        let b = repo.create(Job::new("b", "", "")).await.unwrap();
        let mut c = repo.create(Job::new("c", "", "")).await.unwrap();
        c.set_finished(codefarm_core::JobResult::Success).unwrap();
        repo.save(&c).await.unwrap();

        let queued = repo.find_queued(&[a.id]).await.unwrap();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].id, b.id);
    }

    #[tokio::test]
    async fn test_save_and_remove_unknown_job() {
        let (repo, _rx) = repo();
        let job = Job::new("ghost", "", "");
        assert!(matches!(repo.save(&job).await, Err(DbError::NotFound(_))));
        assert!(matches!(repo.remove(job.id).await, Err(DbError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_failed_update_leaves_job_untouched() {
        let (repo, _rx) = repo();
        let job = repo.create(Job::new("build", "make", "")).await.unwrap();

        let result = repo
            .update(job.id, Box::new(|job: &mut Job| job.set_ongoing("log-1")))
            .await;
        assert!(matches!(result, Err(DbError::Domain(_))));
        assert_eq!(repo.get(job.id).await.unwrap(), job);

        let updated = repo
            .update(
                job.id,
                Box::new(|job: &mut Job| job.set_allocated(codefarm_core::SlaveId::new("s1"))),
            )
            .await
            .unwrap();
        assert_eq!(updated.status, JobStatus::Ongoing);
    }

    #[tokio::test]
    async fn test_remove_publishes_event() {
        let (repo, mut rx) = repo();
        let job = repo.create(Job::new("build", "make", "")).await.unwrap();
        repo.remove(job.id).await.unwrap();

        let _created = rx.recv().await.unwrap();
        assert_eq!(rx.recv().await.unwrap(), Event::JobRemoved { job_id: job.id });
        assert!(repo.list().await.unwrap().is_empty());
    }
}
