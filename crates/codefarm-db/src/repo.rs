//! Repository traits and implementations.

pub mod executor;
pub mod job;
pub mod slave;

pub use executor::{ExecutorRepo, MemExecutorRepo};
pub use job::{JobMutation, JobRepo, MemJobRepo};
pub use slave::{MemSlaveRepo, SlaveRepo};
