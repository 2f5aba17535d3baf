//! Sync orchestration: job lifecycle, admission control and scheduling.
//!
//! - `SyncOrchestrator` accepts triggers (`submit_job`, `cancel_job`) and runs
//!   each admitted job as its own task.
//! - `pipeline` drives one job: extract, normalize, transform, decide, commit.
//! - `SyncScheduler` submits `Scheduled` jobs for connections whose cron slot is due.
//! - Job records, connections and checkpoints persist through `SyncStore`.

pub mod admission;
pub mod events;
pub mod models;
pub mod orchestrator;
pub mod pipeline;
pub mod schedule;
pub mod traits;
