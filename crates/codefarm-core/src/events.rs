//! Domain events and the publish/subscribe port.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::trace;

use crate::callback::CallbackRequest;
use crate::executor::ExecutorRecord;
use crate::job::{Job, JobResult};
use crate::slave::Slave;
use crate::{JobId, SlaveId};

/// Something that happened in the farm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "topic", rename_all = "snake_case")]
pub enum Event {
    SlaveCreated { slave: Slave },
    SlaveUpdated { slave: Slave },
    SlaveTagged { slave: Slave },
    SlaveUntagged { slave: Slave },
    SlaveOnline { slave: Slave },
    SlaveOffline { slave: Slave },
    SlaveRemoved { slave_id: SlaveId },

    JobCreated { job: Job },
    JobUpdated { job: Job },
    JobRequeued { job: Job },
    JobRemoved { job_id: JobId },

    ExecutorAllocated { executor: ExecutorRecord },
    ExecutorStarted { executor: ExecutorRecord },
    ExecutorFinished { executor: ExecutorRecord, result: JobResult },
    ExecutorFailure { executor: ExecutorRecord },
    ExecutorRemoved { executor: ExecutorRecord },
    ExecutorCallback { executor: ExecutorRecord, request: CallbackRequest },
}

impl Event {
    /// Dotted topic name, e.g. `slave.created`.
    pub fn topic(&self) -> &'static str {
        match self {
            Event::SlaveCreated { .. } => "slave.created",
            Event::SlaveUpdated { .. } => "slave.updated",
            Event::SlaveTagged { .. } => "slave.tagged",
            Event::SlaveUntagged { .. } => "slave.untagged",
            Event::SlaveOnline { .. } => "slave.online",
            Event::SlaveOffline { .. } => "slave.offline",
            Event::SlaveRemoved { .. } => "slave.removed",
            Event::JobCreated { .. } => "job.created",
            Event::JobUpdated { .. } => "job.updated",
            Event::JobRequeued { .. } => "job.requeued",
            Event::JobRemoved { .. } => "job.removed",
            Event::ExecutorAllocated { .. } => "executor.allocated",
            Event::ExecutorStarted { .. } => "executor.started",
            Event::ExecutorFinished { .. } => "executor.finished",
            Event::ExecutorFailure { .. } => "executor.failure",
            Event::ExecutorRemoved { .. } => "executor.removed",
            Event::ExecutorCallback { request, .. } => request.topic(),
        }
    }
}

/// Receiving end of a bus subscription. Dropping it unsubscribes.
pub type Subscription = broadcast::Receiver<Event>;

/// Publish/subscribe port for domain events.
pub trait EventBus: Send + Sync {
    fn publish(&self, event: Event);

    fn subscribe(&self) -> Subscription;
}

/// In-process event bus backed by a broadcast channel.
///
/// Subscribers that fall more than `capacity` events behind observe a
/// `Lagged` error and skip the missed events.
#[derive(Clone)]
pub struct InProcessBus {
    sender: broadcast::Sender<Event>,
}

impl InProcessBus {
    pub const DEFAULT_CAPACITY: usize = 1024;

    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }
}

impl Default for InProcessBus {
    fn default() -> Self {
        Self::new(Self::DEFAULT_CAPACITY)
    }
}

impl EventBus for InProcessBus {
    fn publish(&self, event: Event) {
        trace!(topic = event.topic(), "Publishing event");
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    fn subscribe(&self) -> Subscription {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribers_receive_published_events() {
        let bus = InProcessBus::new(8);
        let mut rx = bus.subscribe();

        bus.publish(Event::JobRemoved {
            job_id: JobId::new(),
        });

        let event = rx.recv().await.unwrap();
        assert_eq!(event.topic(), "job.removed");
    }

    #[test]
    fn test_publish_without_subscribers_is_ignored() {
        let bus = InProcessBus::default();
        bus.publish(Event::SlaveRemoved {
            slave_id: SlaveId::new("s1"),
        });
    }
}
