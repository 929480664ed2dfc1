//! Job execution backends for the CodeFarm build farm.
//!
//! Provides executor implementations for running jobs:
//! - Local processes (development and single-host farms)

pub mod local;

pub use codefarm_core::executor::{Executor, ExecutorFactory, ExecutorRecord, ExecutorState};
pub use local::{LocalExecutor, LocalExecutorFactory};
