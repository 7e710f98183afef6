mod demo;

pub use demo::{run_demo, DemoArgs, DemoOutcome};

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// streamtask - cancellable streaming task runner
#[derive(Parser)]
#[command(name = "streamtask")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// SQLite file for persisted events (overrides STREAMTASK_DATABASE_PATH)
    #[arg(long, global = true)]
    pub database: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run simulated batch jobs and persist their events
    Demo(DemoArgs),

    /// Show the persisted events of one task
    History {
        /// Task id
        task_id: String,
    },

    /// List recently persisted tasks
    Tasks {
        /// Number of tasks to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },
}
