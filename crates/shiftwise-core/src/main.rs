// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shiftwise Core - Scaling-Group Deployment Orchestrator
//!
//! The server binary is responsible for:
//! - Accepting worker connections and pushing work orders
//! - Resuming awaiting steps as task responses arrive
//! - Resending orders of steps that were awaiting a response at restart
//! - Running housekeeping jobs on the primary instance

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::TcpListener;
use tracing::{error, info};

use shiftwise_core::config::Config;
use shiftwise_core::persistence::SqlitePersistence;
use shiftwise_core::runtime::OrchestratorRuntime;
use shiftwise_core::scheduler::{
    JOB_RUNNER_LEASE, LeaseLeaderElection, RecurringJobRunner, RunRetentionJob, StepExpiryJob,
};
use shiftwise_core::server::{WorkerHub, run_worker_server};

/// Account the system-wide housekeeping jobs run under.
const SYSTEM_ACCOUNT: &str = "system";

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file (from crate directory or parent directories)
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("shiftwise_core=info".parse()?),
        )
        .init();

    info!("Starting Shiftwise Core");

    let config = Config::from_env().map_err(|e| {
        error!("Configuration error: {}", e);
        e
    })?;

    info!(
        worker_addr = %config.worker_addr,
        instance_id = %config.instance_id,
        default_timeout_minutes = config.default_timeout_minutes,
        "Configuration loaded"
    );

    info!("Connecting to database...");
    let persistence = Arc::new(SqlitePersistence::connect(&config.database_url).await?);
    info!("Database ready, migrations applied");

    let hub = Arc::new(WorkerHub::new());
    let runtime = OrchestratorRuntime::builder()
        .persistence(persistence.clone())
        .queue(hub.clone())
        .default_timeout_minutes(config.default_timeout_minutes)
        .build()?
        .start()
        .await?;

    let listener = TcpListener::bind(config.worker_addr).await?;
    let worker_server_handle = tokio::spawn(run_worker_server(
        listener,
        hub,
        runtime.inbound(),
        runtime.shutdown_signal(),
    ));

    let election = Arc::new(LeaseLeaderElection::new(
        persistence.clone(),
        JOB_RUNNER_LEASE,
        config.instance_id.clone(),
        config.job_poll_interval * 3,
    ));
    let retention = Duration::from_secs(u64::from(config.run_retention_days) * 24 * 3600);
    let runner = Arc::new(
        RecurringJobRunner::new(persistence.clone(), election, config.job_poll_interval)
            .with_job(Arc::new(StepExpiryJob::new(
                runtime.orchestrator().clone(),
                SYSTEM_ACCOUNT,
            )))
            .with_job(Arc::new(RunRetentionJob::new(
                persistence.clone(),
                SYSTEM_ACCOUNT,
                retention,
            ))),
    );
    let runner_shutdown = runner.shutdown_handle();
    let runner_handle = {
        let runner = runner.clone();
        tokio::spawn(async move { runner.run().await })
    };

    info!("Shiftwise Core initialized successfully");

    tokio::signal::ctrl_c().await?;
    info!("Shutting down...");

    runner_shutdown.notify_one();
    runtime.shutdown().await?;

    match worker_server_handle.await {
        Ok(Err(e)) => error!("Worker server error: {}", e),
        Err(e) => error!("Worker server task failed: {}", e),
        Ok(Ok(())) => {}
    }
    if let Err(e) = runner_handle.await {
        error!("Recurring job runner task failed: {}", e);
    }

    persistence.pool().close().await;
    info!("Shutdown complete");

    Ok(())
}
