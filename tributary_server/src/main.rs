use clap::Parser;
use std::path::Path;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tributary_core::storage::sqlite::SqliteStateDb;
use tributary_core::{
    JobQuery, JobStatus, StaticCredentials, SyncConfig, SyncScheduler, SyncStore, TriggerKind,
};
use tributary_server::backends::{redact, register_manifest, Backends, DESTINATION_DB_URL_ENV};
use tributary_server::cli::{Cli, Commands};
use tributary_server::manifest::Manifest;

fn env_lookup(var: &str) -> Option<String> {
    std::env::var(var).ok()
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tributary_core::o11y::init_global_from_env()?;
    let cli = Cli::parse();
    let data_dir = cli.data_dir;

    match cli.command.unwrap_or(Commands::Run { manifest: None }) {
        Commands::Run { manifest } => run(&data_dir, manifest.as_deref()).await?,
        Commands::Sync {
            manifest,
            connection_id,
        } => {
            let config = SyncConfig::from_env()?;
            let manifest = Manifest::load(&manifest).await?;
            let Some(entry) = manifest.get(connection_id) else {
                anyhow::bail!("connection {connection_id} is not in the manifest");
            };
            let credentials = Arc::new(StaticCredentials::new());
            let orchestrator = Backends::from_env(&data_dir)
                .await?
                .orchestrator(config, credentials.clone())
                .await?;
            orchestrator.recover_interrupted_jobs().await?;
            let single = Manifest {
                connections: vec![entry.clone()],
            };
            register_manifest(&orchestrator, &credentials, &single, env_lookup).await?;

            let job_id = orchestrator
                .submit_job(connection_id, TriggerKind::Manual)
                .await?;
            let job = tokio::select! {
                job = orchestrator.wait_for_job(job_id) => job?,
                _ = tokio::signal::ctrl_c() => {
                    orchestrator.cancel_job(job_id).await?;
                    orchestrator.wait_for_job(job_id).await?
                }
            };
            orchestrator.shutdown().await;
            println!("{}", serde_json::to_string_pretty(&job)?);
            if job.status != JobStatus::Completed {
                anyhow::bail!("job {} ended {}", job.job_id, job.status);
            }
        }
        Commands::Status { job_id } => {
            let store = SqliteStateDb::new(data_dir.join("state.db")).await?;
            let Some(job) = store.get_job(job_id).await? else {
                anyhow::bail!("job {job_id} not found");
            };
            println!("{}", serde_json::to_string_pretty(&job)?);
        }
        Commands::Jobs {
            connection,
            status,
            limit,
        } => {
            let store = SqliteStateDb::new(data_dir.join("state.db")).await?;
            let jobs = store
                .list_jobs(&JobQuery {
                    connection_id: connection,
                    status,
                    limit,
                    ..JobQuery::default()
                })
                .await?;
            for job in jobs {
                println!("{}", serde_json::to_string(&job)?);
            }
        }
        Commands::Validate { path } => {
            let manifest = Manifest::load(&path).await?;
            // Same checks as startup registration, against throwaway backends.
            let orchestrator = Backends::in_memory()?
                .orchestrator(SyncConfig::default(), Arc::new(StaticCredentials::new()))
                .await?;
            let mut failed = 0usize;
            for entry in &manifest.connections {
                let checked = match entry.to_connection() {
                    Ok(conn) => orchestrator.register_connection(conn).await.map(|_| ()),
                    Err(e) => Err(e),
                };
                match checked {
                    Ok(()) => println!("{} ({}): ok", entry.id, entry.name),
                    Err(e) => {
                        failed += 1;
                        println!("{} ({}): {e}", entry.id, entry.name);
                    }
                }
            }
            if failed > 0 {
                anyhow::bail!("{failed} connection(s) failed validation");
            }
        }
        Commands::Config => {
            let sync = SyncConfig::from_env()?;
            let cfg = serde_json::json!({
                "data_dir": data_dir,
                "sync": sync,
                DESTINATION_DB_URL_ENV: std::env::var(DESTINATION_DB_URL_ENV).ok().map(|v| redact(&v)),
                "TRIBUTARY_MANIFEST": std::env::var("TRIBUTARY_MANIFEST").ok(),
                "TRIBUTARY_LOG_FORMAT": std::env::var("TRIBUTARY_LOG_FORMAT").ok(),
            });
            println!("{}", serde_json::to_string_pretty(&cfg)?);
        }
    }
    Ok(())
}

/// Daemon: recover, register, then schedule until Ctrl-C.
#[tracing::instrument(level = "info", skip_all)]
async fn run(data_dir: &Path, manifest: Option<&Path>) -> anyhow::Result<()> {
    let config = SyncConfig::from_env()?;
    let backends = Backends::from_env(data_dir).await?;
    let store: Arc<dyn SyncStore> = backends.store.clone();
    let credentials = Arc::new(StaticCredentials::new());
    let orchestrator = Arc::new(
        backends
            .orchestrator(config.clone(), credentials.clone())
            .await?,
    );

    let recovered = orchestrator.recover_interrupted_jobs().await?;
    if recovered > 0 {
        tracing::warn!(recovered, "marked interrupted jobs as failed");
    }
    if let Some(path) = manifest {
        let manifest = Manifest::load(path).await?;
        let conns = register_manifest(&orchestrator, &credentials, &manifest, env_lookup).await?;
        tracing::info!(connections = conns.len(), "manifest loaded");
    }

    let scheduler =
        SyncScheduler::new(store, orchestrator.clone(), config.scheduler_poll_interval())?;
    let cancel = CancellationToken::new();
    let scheduler_task = tokio::spawn({
        let cancel = cancel.clone();
        async move { scheduler.run_loop(cancel).await }
    });

    tracing::info!("tributary running; Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    cancel.cancel();
    scheduler_task.await?;
    orchestrator.shutdown().await;
    Ok(())
}
