//! KDL configuration parsing for the CodeFarm build farm.
//!
//! This crate handles parsing of the farm configuration (codefarm.kdl):
//! - Scheduler and logging settings
//! - The local executor backend
//! - Platform service endpoints
//! - Seed slaves and jobs

pub mod error;
pub mod farm;

pub use error::{ConfigError, ConfigResult};
pub use farm::{
    ExecutorConfig, FarmConfig, JobDef, LogFormat, LoggingConfig, SchedulerConfig, SlaveDef,
    load_farm_config, parse_farm_config,
};
