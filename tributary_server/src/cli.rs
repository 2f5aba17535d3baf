use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tributary_core::{ConnectionId, JobId, JobStatus};

#[derive(Debug, Parser)]
#[command(name = "tributary", version, about = "Multi-tenant sync and transformation pipeline")]
pub struct Cli {
    /// Local state directory (SQLite job + cursor store).
    #[arg(long, global = true, env = "TRIBUTARY_DATA_DIR", default_value = ".tributary")]
    pub data_dir: PathBuf,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Register the manifest's connections and run scheduled syncs until Ctrl-C
    /// (default if no subcommand given).
    Run {
        /// Connections manifest (YAML/JSON).
        #[arg(long, env = "TRIBUTARY_MANIFEST")]
        manifest: Option<PathBuf>,
    },

    /// Run one manual sync job for a connection, wait for it, and print the job.
    Sync {
        #[arg(long, env = "TRIBUTARY_MANIFEST")]
        manifest: PathBuf,

        connection_id: ConnectionId,
    },

    /// Print one job record.
    Status { job_id: JobId },

    /// List jobs, newest first.
    Jobs {
        #[arg(long)]
        connection: Option<ConnectionId>,

        /// pending | running | completed | failed | cancelled
        #[arg(long)]
        status: Option<JobStatus>,

        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Validate a connections manifest without contacting any source.
    Validate {
        /// Path to YAML/JSON manifest.
        path: PathBuf,
    },

    /// Print current configuration (redacted secrets).
    Config,
}
