//! Worker nodes (slaves).

use serde::{Deserialize, Serialize};
use url::Url;

use crate::SlaveId;
use crate::criteria::TagCriteria;

/// A worker node capable of running a bounded number of concurrent jobs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "SlaveFields")]
pub struct Slave {
    pub id: SlaveId,
    pub uri: Url,
    /// Tag set. Always contains the slave's own id.
    tags: Vec<String>,
    /// Maximum number of concurrent executors.
    pub executors: usize,
    pub offline: bool,
}

/// Wire form of a slave; converting it restores the own-id tag.
#[derive(Deserialize)]
struct SlaveFields {
    id: SlaveId,
    uri: Url,
    #[serde(default)]
    tags: Vec<String>,
    executors: usize,
    #[serde(default)]
    offline: bool,
}

impl From<SlaveFields> for Slave {
    fn from(fields: SlaveFields) -> Self {
        let mut slave = Slave::new(fields.id, fields.uri, fields.tags, fields.executors);
        slave.offline = fields.offline;
        slave
    }
}

impl Slave {
    /// Create an online slave.
    pub fn new(id: impl Into<SlaveId>, uri: Url, tags: Vec<String>, executors: usize) -> Self {
        let mut slave = Self {
            id: id.into(),
            uri,
            tags: Vec::new(),
            executors,
            offline: false,
        };
        slave.set_tags(tags);
        slave
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    /// Replace the tag set, keeping the slave's own id.
    pub fn set_tags(&mut self, tags: Vec<String>) {
        self.tags.clear();
        for tag in tags {
            self.tag(tag);
        }
        self.tag(self.id.to_string());
    }

    /// Add a tag. Returns false if it was already present.
    pub fn tag(&mut self, tag: impl Into<String>) -> bool {
        let tag = tag.into();
        if self.tags.contains(&tag) {
            return false;
        }
        self.tags.push(tag);
        true
    }

    /// Remove a tag. The slave's own id cannot be removed.
    pub fn untag(&mut self, tag: &str) -> bool {
        if tag == self.id.as_str() {
            return false;
        }
        let before = self.tags.len();
        self.tags.retain(|t| t != tag);
        before != self.tags.len()
    }

    pub fn matches(&self, criteria: &TagCriteria) -> bool {
        criteria.matches(&self.tags)
    }
}
