//! Long-running roles — `bughunt scheduler` and `bughunt worker`.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::info;

use bughunt::git::GitCli;
use bughunt::sandbox::DockerSandbox;
use bughunt::scheduler::Scheduler;
use bughunt::storage::DbHandle;
use bughunt::worker::Worker;

use super::{load_config, open_db};
use crate::Cli;

/// A token cancelled on the first SIGINT or SIGTERM.
fn shutdown_token() -> Result<CancellationToken> {
    let token = CancellationToken::new();
    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let cancel = token.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        info!("Shutting down");
        cancel.cancel();
    });
    Ok(token)
}

pub async fn run_scheduler(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let db = Arc::new(DbHandle::new(open_db(&config)?));
    let scheduler = Scheduler::new(
        db.clone(),
        db.clone(),
        db,
        Arc::new(GitCli::default()),
        config.scheduler.clone(),
    );
    scheduler.run_forever(shutdown_token()?).await;
    Ok(())
}

pub async fn run_worker(cli: &Cli) -> Result<()> {
    let config = load_config(cli)?;
    let db = Arc::new(DbHandle::new(open_db(&config)?));
    let sandbox = Arc::new(DockerSandbox::new(&config.sandbox)?);
    let worker = Worker::new(
        db,
        sandbox,
        Arc::new(GitCli::default()),
        config.worker.clone(),
    );
    worker.run_forever(shutdown_token()?).await;
    Ok(())
}
