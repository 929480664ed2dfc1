//! Verify a single slave with a diagnostic job.

use super::{Farm, build};
use anyhow::{Context, Result};
use codefarm_config::FarmConfig;
use codefarm_core::SlaveId;
use codefarm_db::SlaveRepo;

pub async fn verify(config: FarmConfig, slave_id: &str) -> Result<()> {
    let Farm {
        scheduler, slaves, ..
    } = build(&config).await?;

    let slave = slaves
        .get(&SlaveId::new(slave_id))
        .await
        .with_context(|| format!("Unknown slave: {}", slave_id))?;

    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;
    let outcome = scheduler.verify_slave(&slave).await;
    scheduler.dispose().await;

    let outcome = outcome.with_context(|| format!("Failed to verify slave {}", slave_id))?;
    if outcome.ok {
        println!("{}: {}", slave_id, outcome.message);
        Ok(())
    } else {
        anyhow::bail!("{}: {}", slave_id, outcome.message)
    }
}
