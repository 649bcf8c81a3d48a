use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Automated trading orchestrator — collects user system investments before
/// each market close, computes target portfolios, and reconciles broker
/// accounts with the minimal set of orders.
#[derive(Parser)]
#[command(name = "trade-flow", version, about)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the scheduler daemon: fire once per trading day before the close
    Run {
        /// Execution mode: simulate, execute-paper, or execute-live
        #[arg(long, default_value = "execute-paper")]
        mode: String,
    },

    /// Trigger one execution immediately (ignores the daily suppression)
    Execute {
        /// Restrict the run to a single user id
        #[arg(long)]
        user: Option<String>,

        /// Credential scope for --user: paper or live
        #[arg(long, default_value = "paper")]
        credential_type: String,

        /// Execution mode: simulate, execute-paper, or execute-live
        #[arg(long, default_value = "simulate")]
        mode: String,
    },

    /// List recent executions
    History {
        /// Maximum number of executions to show
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show one execution with its queue and per-user results
    Show {
        /// Execution id (uuid)
        execution_id: String,
    },

    /// Compute a user's merged target allocation and write it as CSV
    ExportAllocations {
        /// User id
        user: String,

        /// Credential scope: paper or live
        #[arg(long, default_value = "paper")]
        credential_type: String,

        /// Output file (default: stdout)
        #[arg(long, short = 'o')]
        output: Option<PathBuf>,
    },
}
