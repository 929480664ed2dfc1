//! Core domain types and ports for the CodeFarm build farm.
//!
//! This crate contains:
//! - Resource identifiers
//! - Jobs, slaves and the executor state machine
//! - Tag criteria parsing and matching
//! - Domain events and the event bus port
//! - The executor contract and its callback protocol
//! - The port to other platform services

pub mod callback;
pub mod criteria;
pub mod error;
pub mod events;
pub mod executor;
pub mod id;
pub mod job;
pub mod services;
pub mod slave;

pub use criteria::TagCriteria;
pub use error::{Error, Result};
pub use events::{Event, EventBus, InProcessBus};
pub use id::{ExecutorId, JobId, SlaveId};
pub use job::{Job, JobResult, JobStatus};
pub use slave::Slave;
