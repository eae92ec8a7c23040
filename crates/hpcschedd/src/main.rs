//! hpcschedd: the batch scheduler daemon.
//!
//! Loads `hpcsched.toml`, talks to the configured resource managers over
//! the Wiki protocol and runs scheduling iterations:
//! - Node and job refresh from every RM
//! - Priority-ordered node selection with preemption
//! - Job start through the owning RM
//!
//! # Usage
//!
//! ```text
//! hpcschedd --config /etc/hpcsched.toml run
//! hpcschedd --config /etc/hpcsched.toml query nodes
//! ```

mod query;
mod scheduler;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use hpc_core::SchedConfig;
use tracing::info;

use crate::query::QueryTarget;
use crate::scheduler::Scheduler;

#[derive(Parser)]
#[command(name = "hpcschedd", about = "Batch scheduler daemon")]
struct Cli {
    /// Configuration file.
    #[arg(long, short, default_value = "hpcsched.toml")]
    config: PathBuf,

    /// Emit logs as JSON.
    #[arg(long)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run scheduling iterations until interrupted.
    Run {
        /// Run a single iteration and print its summary.
        #[arg(long)]
        once: bool,
    },
    /// Print what a resource manager reports, as JSON.
    Query {
        #[arg(value_enum)]
        target: QueryTarget,

        /// Resource manager name. Defaults to the first configured.
        #[arg(long)]
        rm: Option<String>,
    },
    /// Print the effective configuration.
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,hpcschedd=debug"));
    if cli.json_logs {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }

    let config = SchedConfig::from_file(&cli.config)
        .map_err(|e| anyhow::anyhow!("loading {}: {e}", cli.config.display()))?;
    if config.rm.is_empty() {
        anyhow::bail!("{} configures no resource manager", cli.config.display());
    }

    match cli.command {
        Command::Run { once } => run(config, once).await,
        Command::Query { target, rm } => query::run(&config, target, rm.as_deref()).await,
        Command::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

async fn run(config: SchedConfig, once: bool) -> anyhow::Result<()> {
    info!(rms = config.rm.len(), "hpcschedd starting");
    let mut scheduler = Scheduler::new(config);

    if once {
        let summary = scheduler.run_iteration(crate::scheduler::unix_now()).await;
        info!(
            nodes = scheduler.context().nodes.len(),
            jobs = scheduler.context().jobs.len(),
            "iteration complete"
        );
        println!("{}", serde_json::to_string_pretty(&summary)?);
        return Ok(());
    }

    scheduler
        .run(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "cannot listen for ctrl-c");
                std::future::pending::<()>().await;
            }
            info!("shutdown signal received");
        })
        .await
}
