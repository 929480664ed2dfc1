//! Job scheduling for the CodeFarm build farm.
//!
//! Matches queued jobs to tag-qualified, capacity-limited slaves and
//! drives each job through its executor's lifecycle. All work is
//! triggered by domain events from the bus.

pub mod callbacks;
pub mod control;
pub mod error;
pub mod pool;
pub mod services;
pub mod verify;

#[cfg(test)]
mod testing;

pub use callbacks::{CallbackBroker, CallbackError};
pub use control::{Allocation, PassStats, Scheduler, Stores};
pub use error::{SchedulerError, SchedulerResult};
pub use pool::{Binding, ExecutorPool};
pub use services::HttpServices;
pub use verify::Verification;
