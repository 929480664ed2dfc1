//! Resource identifiers.

use derive_more::Display;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Declares a UUIDv7-backed identifier type.
/// UUIDv7 keeps ids time-ordered and sortable.
macro_rules! resource_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display,
        )]
        #[display("{_0}")]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            /// Create a new unique id using UUIDv7.
            pub fn new() -> Self {
                Self(Uuid::now_v7())
            }

            /// Create an id from an existing UUID.
            pub fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get the underlying UUID.
            pub fn as_uuid(&self) -> &Uuid {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl From<Uuid> for $name {
            fn from(uuid: Uuid) -> Self {
                Self(uuid)
            }
        }

        impl From<$name> for Uuid {
            fn from(id: $name) -> Self {
                id.0
            }
        }

        impl std::str::FromStr for $name {
            type Err = uuid::Error;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                Ok(Self(Uuid::parse_str(s)?))
            }
        }
    };
}

resource_id!(
    /// Identifier of a job.
    JobId
);

resource_id!(
    /// Identifier of an executor (one job-to-slave binding).
    ExecutorId
);

/// Identifier of a slave.
///
/// Slave ids are operator-chosen names rather than UUIDs because a slave's id
/// doubles as one of its tags, so criteria can pin a job to a single slave.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Display)]
#[display("{_0}")]
#[serde(transparent)]
pub struct SlaveId(String);

impl SlaveId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for SlaveId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for SlaveId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_are_time_ordered() {
        let first = JobId::new();
        let second = JobId::new();
        assert!(first < second);
    }

    #[test]
    fn test_id_parses_its_display_form() {
        let id = ExecutorId::new();
        let parsed: ExecutorId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn test_slave_id_serializes_as_plain_string() {
        let id = SlaveId::new("builder-1");
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"builder-1\"");
    }
}
