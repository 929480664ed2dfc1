//! The scheduler's set of active executors.

use codefarm_core::executor::Executor;
use codefarm_core::{ExecutorId, JobId, SlaveId};
use std::collections::BTreeMap;
use std::sync::Arc;

/// Which job and slave an active executor serves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub executor_id: ExecutorId,
    pub job_id: Option<JobId>,
    pub slave_id: Option<SlaveId>,
}

struct Entry {
    executor: Arc<dyn Executor>,
    job_id: Option<JobId>,
    slave_id: Option<SlaveId>,
}

/// Active executors keyed by id.
///
/// An entry is added when its slot is reserved, before the executor is
/// allocated, so it counts against the slave's capacity from that moment.
#[derive(Default)]
pub struct ExecutorPool {
    entries: BTreeMap<ExecutorId, Entry>,
}

impl ExecutorPool {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        executor: Arc<dyn Executor>,
        job_id: Option<JobId>,
        slave_id: Option<SlaveId>,
    ) {
        self.entries.insert(
            executor.id(),
            Entry {
                executor,
                job_id,
                slave_id,
            },
        );
    }

    pub fn remove(&mut self, id: ExecutorId) -> Option<Arc<dyn Executor>> {
        self.entries.remove(&id).map(|entry| entry.executor)
    }

    pub fn get(&self, id: ExecutorId) -> Option<Arc<dyn Executor>> {
        self.entries.get(&id).map(|entry| entry.executor.clone())
    }

    /// Number of executors occupying a slot on `slave_id`.
    pub fn count_on_slave(&self, slave_id: &SlaveId) -> usize {
        self.entries
            .values()
            .filter(|entry| entry.slave_id.as_ref() == Some(slave_id))
            .count()
    }

    pub fn is_job_bound(&self, job_id: JobId) -> bool {
        self.entries
            .values()
            .any(|entry| entry.job_id == Some(job_id))
    }

    /// Remove and return every executor bound to `slave_id`.
    pub fn take_on_slave(&mut self, slave_id: &SlaveId) -> Vec<Arc<dyn Executor>> {
        let ids: Vec<ExecutorId> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.slave_id.as_ref() == Some(slave_id))
            .map(|(id, _)| *id)
            .collect();
        ids.into_iter().filter_map(|id| self.remove(id)).collect()
    }

    /// Remove and return the executor bound to `job_id`, if any.
    pub fn take_for_job(&mut self, job_id: JobId) -> Option<Arc<dyn Executor>> {
        let id = self
            .entries
            .iter()
            .find(|(_, entry)| entry.job_id == Some(job_id))
            .map(|(id, _)| *id)?;
        self.remove(id)
    }

    /// Empty the pool.
    pub fn drain(&mut self) -> Vec<Arc<dyn Executor>> {
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|entry| entry.executor)
            .collect()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.entries
            .iter()
            .map(|(id, entry)| Binding {
                executor_id: *id,
                job_id: entry.job_id,
                slave_id: entry.slave_id.clone(),
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockExecutor;

    #[test]
    fn test_counts_and_takes_by_binding() {
        let mut pool = ExecutorPool::new();
        let s1 = SlaveId::new("s1");
        let s2 = SlaveId::new("s2");
        let job = JobId::new();

        let a = MockExecutor::detached();
        let b = MockExecutor::detached();
        let c = MockExecutor::detached();
        pool.insert(a.clone(), Some(job), Some(s1.clone()));
        pool.insert(b.clone(), Some(JobId::new()), Some(s1.clone()));
        pool.insert(c.clone(), Some(JobId::new()), Some(s2.clone()));

        assert_eq!(pool.count_on_slave(&s1), 2);
        assert_eq!(pool.count_on_slave(&SlaveId::new("s3")), 0);
        assert!(pool.is_job_bound(job));

        let taken = pool.take_for_job(job).unwrap();
        assert_eq!(taken.id(), a.id());
        assert!(!pool.is_job_bound(job));
        assert!(pool.take_for_job(job).is_none());

        let on_s1 = pool.take_on_slave(&s1);
        assert_eq!(on_s1.len(), 1);
        assert_eq!(on_s1[0].id(), b.id());
        assert_eq!(pool.len(), 1);

        let rest = pool.drain();
        assert_eq!(rest[0].id(), c.id());
        assert!(pool.is_empty());
    }
}
