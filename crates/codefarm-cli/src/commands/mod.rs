//! CLI command implementations.

pub mod run;
pub mod verify;

use anyhow::{Context, Result};
use codefarm_config::{FarmConfig, load_farm_config};
use codefarm_core::{EventBus, InProcessBus, TagCriteria};
use codefarm_db::{MemExecutorRepo, MemJobRepo, MemSlaveRepo, SlaveRepo};
use codefarm_executor::LocalExecutorFactory;
use codefarm_scheduler::{HttpServices, Scheduler, Stores};
use std::sync::Arc;

/// Read and parse the farm configuration at `path`.
pub fn load(path: &str) -> Result<FarmConfig> {
    load_farm_config(path).with_context(|| format!("Failed to load farm config: {}", path))
}

pub fn validate(path: &str) -> Result<()> {
    match load_farm_config(path) {
        Ok(config) => {
            println!(
                "Configuration is valid ({} slaves, {} jobs)",
                config.slaves.len(),
                config.jobs.len()
            );
            Ok(())
        }
        Err(e) => {
            println!("Configuration error: {}", e);
            std::process::exit(1);
        }
    }
}

pub fn match_tags(criteria: &str, tags: &[String]) -> Result<()> {
    let parsed = TagCriteria::parse(criteria)
        .with_context(|| format!("Invalid criteria: {}", criteria))?;
    if parsed.matches(tags) {
        println!("match");
        Ok(())
    } else {
        println!("no match");
        std::process::exit(1);
    }
}

/// A scheduler wired to in-memory stores and the local executor backend.
pub struct Farm {
    pub scheduler: Arc<Scheduler>,
    pub jobs: Arc<MemJobRepo>,
    pub slaves: Arc<MemSlaveRepo>,
}

/// Build the farm and register the configured slaves.
pub async fn build(config: &FarmConfig) -> Result<Farm> {
    let bus: Arc<dyn EventBus> = Arc::new(InProcessBus::new(config.scheduler.event_capacity));
    let jobs = Arc::new(MemJobRepo::new(bus.clone()));
    let slaves = Arc::new(MemSlaveRepo::new(bus.clone()));
    let executors = Arc::new(MemExecutorRepo::new());

    let factory = Arc::new(LocalExecutorFactory::new(
        bus.clone(),
        executors.clone(),
        &config.executor.work_dir,
        &config.executor.shell,
    ));
    let services = Arc::new(HttpServices::new(config.services.clone()));

    for def in &config.slaves {
        slaves
            .create(def.to_slave())
            .await
            .with_context(|| format!("Failed to register slave {}", def.id))?;
    }

    let scheduler = Arc::new(Scheduler::new(
        Stores {
            jobs: jobs.clone(),
            slaves: slaves.clone(),
            executors,
        },
        factory,
        services,
        bus,
        config.scheduler.clone(),
    ));

    Ok(Farm {
        scheduler,
        jobs,
        slaves,
    })
}
