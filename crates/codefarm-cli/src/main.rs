//! CodeFarm CLI tool.

use clap::{Parser, Subcommand};
use codefarm_config::{LogFormat, LoggingConfig};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "codefarm")]
#[command(about = "CodeFarm build farm scheduler", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the farm described by a configuration file
    Run {
        /// Path to the farm configuration
        #[arg(long, env = "CODEFARM_CONFIG", default_value = "codefarm.kdl")]
        config: String,
        /// Exit once every configured job has finished
        #[arg(long)]
        exit_when_idle: bool,
    },
    /// Validate a farm configuration
    Validate {
        /// Path to the configuration file
        #[arg(default_value = "codefarm.kdl")]
        path: String,
    },
    /// Check whether a tag set satisfies a criteria expression
    Match {
        /// Criteria expression, e.g. "linux && x86_64"
        criteria: String,
        /// Tags of the slave
        tags: Vec<String>,
    },
    /// Run a diagnostic job on one configured slave
    Verify {
        /// Slave id
        slave: String,
        /// Path to the farm configuration
        #[arg(long, env = "CODEFARM_CONFIG", default_value = "codefarm.kdl")]
        config: String,
    },
}

/// Install the global subscriber. `RUST_LOG` wins over the configured level.
fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match logging.format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            exit_when_idle,
        } => {
            let farm = commands::load(&config)?;
            init_tracing(&farm.logging);
            commands::run::run(farm, exit_when_idle).await?;
        }
        Commands::Validate { path } => {
            commands::validate(&path)?;
        }
        Commands::Match { criteria, tags } => {
            commands::match_tags(&criteria, &tags)?;
        }
        Commands::Verify { slave, config } => {
            let farm = commands::load(&config)?;
            init_tracing(&farm.logging);
            commands::verify::verify(farm, &slave).await?;
        }
    }

    Ok(())
}
