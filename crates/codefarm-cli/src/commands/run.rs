//! Run the configured farm until interrupted or idle.

use super::{Farm, build};
use anyhow::{Context, Result};
use codefarm_config::FarmConfig;
use codefarm_core::Job;
use codefarm_db::JobRepo;
use std::time::Duration;
use tracing::info;

const IDLE_POLL: Duration = Duration::from_millis(500);

pub async fn run(config: FarmConfig, exit_when_idle: bool) -> Result<()> {
    let Farm {
        scheduler, jobs, ..
    } = build(&config).await?;

    for def in &config.jobs {
        let job = jobs
            .create(def.to_job())
            .await
            .with_context(|| format!("Failed to queue job {}", def.name))?;
        info!(job_id = %job.id, name = %job.name, criteria = %job.criteria, "Queued job");
    }

    println!(
        "Running farm: {} slaves, {} jobs",
        config.slaves.len(),
        config.jobs.len()
    );
    scheduler
        .start()
        .await
        .context("Failed to start scheduler")?;

    if exit_when_idle {
        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => break,
                _ = tokio::time::sleep(IDLE_POLL) => {
                    let all = jobs.list().await?;
                    if all.iter().all(|job| job.status.is_terminal()) {
                        break;
                    }
                }
            }
        }
    } else {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for Ctrl-C")?;
    }

    scheduler.dispose().await;
    print_summary(&jobs.list().await?);
    Ok(())
}

fn print_summary(jobs: &[Job]) {
    println!();
    println!("{:<38} {:<24} {:<10} {:<6} SLAVE", "JOB", "NAME", "STATUS", "RUNS");
    for job in jobs {
        let slave = job
            .last_run()
            .map(|run| run.slave_id.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<38} {:<24} {:<10} {:<6} {}",
            job.id.to_string(),
            job.name,
            job.status.to_string(),
            job.runs.len(),
            slave
        );
    }
}
