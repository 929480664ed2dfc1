//! Slave registry.

use async_trait::async_trait;
use codefarm_core::{Event, EventBus, Slave, SlaveId};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use crate::{DbError, DbResult};

#[async_trait]
pub trait SlaveRepo: Send + Sync {
    async fn create(&self, slave: Slave) -> DbResult<Slave>;
    async fn get(&self, id: &SlaveId) -> DbResult<Slave>;
    /// All slaves in registry order.
    async fn list(&self) -> DbResult<Vec<Slave>>;
    /// Online slaves in registry order.
    async fn list_online(&self) -> DbResult<Vec<Slave>>;
    /// Persist changes to an existing slave (`slave.updated`).
    async fn save(&self, slave: &Slave) -> DbResult<()>;
    async fn tag(&self, id: &SlaveId, tag: &str) -> DbResult<Slave>;
    async fn untag(&self, id: &SlaveId, tag: &str) -> DbResult<Slave>;
    async fn set_online(&self, id: &SlaveId) -> DbResult<Slave>;
    async fn set_offline(&self, id: &SlaveId) -> DbResult<Slave>;
    async fn remove(&self, id: &SlaveId) -> DbResult<()>;
}

/// In-memory implementation of SlaveRepo.
pub struct MemSlaveRepo {
    slaves: RwLock<Vec<Slave>>,
    bus: Arc<dyn EventBus>,
}

impl MemSlaveRepo {
    pub fn new(bus: Arc<dyn EventBus>) -> Self {
        Self {
            slaves: RwLock::new(Vec::new()),
            bus,
        }
    }

    /// Apply `f` to the stored slave and return the updated copy.
    async fn update<F>(&self, id: &SlaveId, f: F) -> DbResult<(Slave, bool)>
    where
        F: FnOnce(&mut Slave) -> bool + Send,
    {
        let mut slaves = self.slaves.write().await;
        let slave = slaves
            .iter_mut()
            .find(|s| &s.id == id)
            .ok_or_else(|| DbError::NotFound(format!("slave {}", id)))?;
        let changed = f(slave);
        Ok((slave.clone(), changed))
    }
}

#[async_trait]
impl SlaveRepo for MemSlaveRepo {
    async fn create(&self, slave: Slave) -> DbResult<Slave> {
        {
            let mut slaves = self.slaves.write().await;
            if slaves.iter().any(|s| s.id == slave.id) {
                return Err(DbError::Duplicate(format!("slave {}", slave.id)));
            }
            slaves.push(slave.clone());
        }
        debug!(slave_id = %slave.id, executors = slave.executors, "Slave registered");
        self.bus.publish(Event::SlaveCreated {
            slave: slave.clone(),
        });
        Ok(slave)
    }

    async fn get(&self, id: &SlaveId) -> DbResult<Slave> {
        self.slaves
            .read()
            .await
            .iter()
            .find(|s| &s.id == id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("slave {}", id)))
    }

    async fn list(&self) -> DbResult<Vec<Slave>> {
        Ok(self.slaves.read().await.clone())
    }

    async fn list_online(&self) -> DbResult<Vec<Slave>> {
        Ok(self
            .slaves
            .read()
            .await
            .iter()
            .filter(|s| !s.offline)
            .cloned()
            .collect())
    }

    async fn save(&self, slave: &Slave) -> DbResult<()> {
        let replacement = slave.clone();
        self.update(&slave.id, move |stored| {
            *stored = replacement;
            true
        })
        .await?;
        self.bus.publish(Event::SlaveUpdated {
            slave: slave.clone(),
        });
        Ok(())
    }

    async fn tag(&self, id: &SlaveId, tag: &str) -> DbResult<Slave> {
        let tag = tag.to_string();
        let (slave, changed) = self.update(id, move |s| s.tag(tag)).await?;
        if changed {
            self.bus.publish(Event::SlaveTagged {
                slave: slave.clone(),
            });
        }
        Ok(slave)
    }

    async fn untag(&self, id: &SlaveId, tag: &str) -> DbResult<Slave> {
        let tag = tag.to_string();
        let (slave, changed) = self.update(id, move |s| s.untag(&tag)).await?;
        if changed {
            self.bus.publish(Event::SlaveUntagged {
                slave: slave.clone(),
            });
        }
        Ok(slave)
    }

    async fn set_online(&self, id: &SlaveId) -> DbResult<Slave> {
        let (slave, _) = self
            .update(id, |s| {
                s.offline = false;
                true
            })
            .await?;
        self.bus.publish(Event::SlaveOnline {
            slave: slave.clone(),
        });
        Ok(slave)
    }

    async fn set_offline(&self, id: &SlaveId) -> DbResult<Slave> {
        let (slave, _) = self
            .update(id, |s| {
                s.offline = true;
                true
            })
            .await?;
        debug!(slave_id = %id, "Slave set offline");
        self.bus.publish(Event::SlaveOffline {
            slave: slave.clone(),
        });
        Ok(slave)
    }

    async fn remove(&self, id: &SlaveId) -> DbResult<()> {
        {
            let mut slaves = self.slaves.write().await;
            let before = slaves.len();
            slaves.retain(|s| &s.id != id);
            if slaves.len() == before {
                return Err(DbError::NotFound(format!("slave {}", id)));
            }
        }
        self.bus.publish(Event::SlaveRemoved {
            slave_id: id.clone(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codefarm_core::InProcessBus;
    use url::Url;

    fn slave(id: &str) -> Slave {
        Slave::new(id, Url::parse("local://localhost").unwrap(), vec![], 1)
    }

    #[tokio::test]
    async fn test_list_online_keeps_registry_order() {
        let repo = MemSlaveRepo::new(Arc::new(InProcessBus::default()));
        for id in ["c", "a", "b"] {
            repo.create(slave(id)).await.unwrap();
        }
        repo.set_offline(&SlaveId::new("a")).await.unwrap();

        let ids: Vec<String> = repo
            .list_online()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id.to_string())
            .collect();
        assert_eq!(ids, vec!["c", "b"]);
    }

    #[tokio::test]
    async fn test_tag_publishes_only_on_change() {
        let bus = Arc::new(InProcessBus::new(16));
        let repo = MemSlaveRepo::new(bus.clone());
        repo.create(slave("s1")).await.unwrap();
        let mut rx = bus.subscribe();

        repo.tag(&SlaveId::new("s1"), "linux").await.unwrap();
        repo.tag(&SlaveId::new("s1"), "linux").await.unwrap();
        repo.untag(&SlaveId::new("s1"), "linux").await.unwrap();

        assert_eq!(rx.recv().await.unwrap().topic(), "slave.tagged");
        assert_eq!(rx.recv().await.unwrap().topic(), "slave.untagged");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_save_does_not_announce_offline() {
        let bus = Arc::new(InProcessBus::new(16));
        let repo = MemSlaveRepo::new(bus.clone());
        let mut s = repo.create(slave("s1")).await.unwrap();
        let mut rx = bus.subscribe();

        s.offline = true;
        repo.save(&s).await.unwrap();

        assert_eq!(rx.recv().await.unwrap().topic(), "slave.updated");
        assert!(repo.list_online().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unknown_slave() {
        let repo = MemSlaveRepo::new(Arc::new(InProcessBus::default()));
        assert!(matches!(
            repo.get(&SlaveId::new("nope")).await,
            Err(DbError::NotFound(_))
        ));
        assert!(matches!(
            repo.remove(&SlaveId::new("nope")).await,
            Err(DbError::NotFound(_))
        ));
    }
}
