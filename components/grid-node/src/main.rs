use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use lattice::Strategy;
use uuid::Uuid;

mod dispatch;
mod job;
mod master;
mod types;
mod worker;

use master::{LogSink, MasterConfig};
use worker::WorkerConfig;

#[derive(Parser)]
#[command(name = "grid-node", about = "Distributed Sudoku solver: master and worker roles")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Coordinate jobs: accept puzzles, cut sub-jobs, merge results.
    Master {
        #[arg(long, default_value = "3000")]
        port: u16,
        #[arg(long, default_value = "column")]
        strategy: Strategy,
        #[arg(long, default_value = "90")]
        dead_after_secs: u64,
        #[arg(long, default_value = "60")]
        sweep_every_secs: u64,
        #[arg(long, default_value = "3600")]
        result_ttl_secs: u64,
    },
    /// Pull sub-jobs from a master and solve them.
    Worker {
        /// Falls back to the MASTER_URL environment variable.
        #[arg(long)]
        master_url: Option<String>,
        #[arg(long)]
        worker_id: Option<String>,
        #[arg(long, default_value = "2")]
        poll_secs: u64,
        #[arg(long, default_value = "30")]
        heartbeat_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Master {
            port,
            strategy,
            dead_after_secs,
            sweep_every_secs,
            result_ttl_secs,
        } => {
            let cfg = MasterConfig {
                port,
                strategy,
                dead_after: Duration::from_secs(dead_after_secs),
                sweep_every: Duration::from_secs(sweep_every_secs),
                result_ttl: Duration::from_secs(result_ttl_secs),
            };
            master::run_master(cfg, Arc::new(LogSink)).await?;
        }
        Commands::Worker {
            master_url,
            worker_id,
            poll_secs,
            heartbeat_secs,
        } => {
            let master_url = master_url
                .or_else(|| std::env::var("MASTER_URL").ok())
                .unwrap_or_else(|| "http://localhost:3000".to_string());
            let cfg = WorkerConfig {
                master_url: master_url.trim_end_matches('/').to_string(),
                worker_id: worker_id.unwrap_or_else(|| Uuid::new_v4().to_string()),
                poll_interval: Duration::from_secs(poll_secs),
                heartbeat_every: Duration::from_secs(heartbeat_secs),
            };
            worker::run_worker(cfg).await?;
        }
    }
    Ok(())
}
