//! Stores for CodeFarm.
//!
//! Provides repository traits for jobs, slaves and executors, and in-memory
//! implementations that publish domain events as records change.

pub mod error;
pub mod repo;

pub use error::{DbError, DbResult};
pub use repo::*;
