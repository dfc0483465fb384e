use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use governance::{Constraints, Ledger, LedgerFilter, MissionState, Projector};
use mission_engine::{FallbackPlanner, Kernel, WorkerSet, LEDGER_NAME};

#[derive(Parser)]
#[command(
    name = "mission-engine",
    about = "Operator-sovereign mission execution runtime"
)]
struct Cli {
    /// Data directory root (created when missing).
    #[arg(long, default_value = "data")]
    data_dir: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Boot the kernel, resume interrupted missions, serve until Ctrl-C.
    Run,
    /// Submit one mission with the built-in workers and wait for it.
    Submit {
        #[arg(long)]
        goal: String,
        #[arg(long, default_value = "general")]
        category: String,
        /// Reuse an existing mission instead of creating a twin.
        #[arg(long)]
        idempotency_key: Option<String>,
    },
    /// Replay the ledger and print the derived state.
    Status,
    /// Follow the ledger from a sequence number.
    Tail {
        #[arg(long, default_value_t = 0)]
        from_seq: u64,
    },
}

fn open_kernel(data_dir: &PathBuf) -> Kernel {
    match Kernel::open(
        data_dir,
        Box::new(FallbackPlanner::new()),
        WorkerSet::builtin(),
    ) {
        Ok(kernel) => kernel,
        Err(err) => {
            error!(error = %err, "kernel boot failed");
            std::process::exit(err.exit_code());
        }
    }
}

async fn execute(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Command::Run => {
            let kernel = open_kernel(&cli.data_dir);
            let resumed = kernel
                .recover()
                .context("resuming interrupted missions")?;
            info!(resumed, data_dir = %cli.data_dir.display(), "kernel serving");
            tokio::signal::ctrl_c().await.context("waiting for Ctrl-C")?;
            info!("shutdown requested");
        }
        Command::Submit {
            goal,
            category,
            idempotency_key,
        } => {
            let kernel = open_kernel(&cli.data_dir);
            kernel.recover().context("resuming interrupted missions")?;
            let ticket = kernel
                .create_mission(&goal, &category, Constraints::new(), idempotency_key)
                .context("creating mission")?;
            info!(mission_id = %ticket.mission_id, "mission submitted");

            let view = loop {
                let view = kernel.get_mission(&ticket.mission_id)?;
                if view.state.is_terminal() {
                    break view;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            };
            println!("{}", serde_json::to_string_pretty(&view)?);
            if view.state != MissionState::Success {
                anyhow::bail!("mission ended in {}", view.state);
            }
        }
        Command::Status => {
            let ledger = Ledger::open(cli.data_dir.join("ledger"), LEDGER_NAME)
                .context("opening ledger")?;
            let entries = ledger.read(&LedgerFilter::new())?;
            let projector = Projector::replay(entries.iter());
            println!("{}", projector.snapshot_json());
        }
        Command::Tail { from_seq } => {
            let ledger = std::sync::Arc::new(
                Ledger::open(cli.data_dir.join("ledger"), LEDGER_NAME)
                    .context("opening ledger")?,
            );
            let mut tail = ledger.tail(from_seq);
            loop {
                let entry = tail.next().await?;
                println!("{}", serde_json::to_string(&*entry)?);
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(err) = execute(cli).await {
        error!(error = %err, "command failed");
        std::process::exit(1);
    }
}
