// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Leader-elected recurring jobs.
//!
//! Only the primary instance runs jobs. Each job takes a per-account permit
//! before doing work so overlapping ticks never run it twice. A failing job
//! holds its permit for longer after each consecutive failure; after too many
//! it is disabled and an alert is opened for the account. A later success
//! closes the alert.
//!
//! The permit, the failure count and the alert all live in the database, so
//! another instance that becomes primary picks up where this one left off.
//!
//! Two jobs ship with the crate: [`StepExpiryJob`] fails steps whose worker
//! never answered, and [`RunRetentionJob`] collects finished runs.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Notify;
use tracing::{debug, error, info, warn};

use crate::engine::Orchestrator;
use crate::error::{CoreError, Result};
use crate::persistence::{JobPermitRecord, Persistence};

/// Name of the lease guarding the job runner.
pub const JOB_RUNNER_LEASE: &str = "shiftwise-recurring-jobs";

/// Decides whether this instance should run recurring jobs.
#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Whether this instance is primary right now.
    async fn is_primary(&self) -> Result<bool>;
}

/// Leader election through a durable lease.
pub struct LeaseLeaderElection {
    persistence: Arc<dyn Persistence>,
    lease_name: String,
    holder: String,
    ttl: Duration,
}

impl LeaseLeaderElection {
    /// Elect via the lease `lease_name`, held as `holder` for `ttl` per renewal.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        lease_name: impl Into<String>,
        holder: impl Into<String>,
        ttl: Duration,
    ) -> Self {
        Self {
            persistence,
            lease_name: lease_name.into(),
            holder: holder.into(),
            ttl,
        }
    }
}

#[async_trait]
impl LeaderElection for LeaseLeaderElection {
    async fn is_primary(&self) -> Result<bool> {
        let expires_at = Utc::now() + to_chrono(self.ttl)?;
        self.persistence
            .try_acquire_lease(&self.lease_name, &self.holder, expires_at)
            .await
    }
}

/// Single-instance deployments.
pub struct AlwaysPrimary;

#[async_trait]
impl LeaderElection for AlwaysPrimary {
    async fn is_primary(&self) -> Result<bool> {
        Ok(true)
    }
}

/// A job the runner executes on every tick.
#[async_trait]
pub trait RecurringJob: Send + Sync {
    /// Stable job name, used for the permit and the alert.
    fn name(&self) -> &str;

    /// Account the job runs for.
    fn account_id(&self) -> &str;

    /// Do one round of work.
    async fn run(&self) -> anyhow::Result<()>;
}

/// Permit lease growth for failing jobs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobBackoff {
    /// Lease taken by a healthy job.
    pub base_lease: Duration,
    /// Upper bound of the lease.
    pub max_lease: Duration,
    /// Consecutive failures after which the job is disabled.
    pub max_failures: u32,
}

impl Default for JobBackoff {
    fn default() -> Self {
        Self {
            base_lease: Duration::from_secs(60),
            max_lease: Duration::from_secs(6 * 3600),
            max_failures: 8,
        }
    }
}

impl JobBackoff {
    /// Lease after `failures` consecutive failures: `base * 2^failures`, capped.
    pub fn lease_for(&self, failures: u32) -> Duration {
        let factor = 1u32.checked_shl(failures).unwrap_or(u32::MAX);
        self.base_lease
            .checked_mul(factor)
            .unwrap_or(self.max_lease)
            .min(self.max_lease)
    }

    /// Whether a job with `failures` consecutive failures is disabled.
    pub fn should_disable(&self, failures: u32) -> bool {
        failures >= self.max_failures
    }
}

/// What happened to one job on a tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobTickOutcome {
    /// Another tick holds the permit.
    PermitHeld,
    /// Disabled after too many failures.
    Disabled,
    /// Ran and succeeded.
    Succeeded,
    /// Ran and failed.
    Failed {
        /// Consecutive failures including this one.
        failures: u32,
        /// Whether this failure disabled the job.
        disabled: bool,
    },
}

/// Result of one tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickReport {
    /// This instance is not primary; nothing ran.
    NotPrimary,
    /// Per-job outcomes, in registration order.
    Ran(Vec<(String, JobTickOutcome)>),
}

/// Runs recurring jobs on the primary instance.
pub struct RecurringJobRunner {
    persistence: Arc<dyn Persistence>,
    election: Arc<dyn LeaderElection>,
    jobs: Vec<Arc<dyn RecurringJob>>,
    backoff: JobBackoff,
    poll_interval: Duration,
    shutdown: Arc<Notify>,
}

impl RecurringJobRunner {
    /// Create a runner without jobs.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        election: Arc<dyn LeaderElection>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            persistence,
            election,
            jobs: Vec::new(),
            backoff: JobBackoff::default(),
            poll_interval,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Register a job.
    pub fn with_job(mut self, job: Arc<dyn RecurringJob>) -> Self {
        self.jobs.push(job);
        self
    }

    /// Override the backoff policy.
    pub fn with_backoff(mut self, backoff: JobBackoff) -> Self {
        self.backoff = backoff;
        self
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Tick every poll interval until shutdown.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.poll_interval.as_secs(),
            jobs = self.jobs.len(),
            "Recurring job runner started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Recurring job runner received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.poll_interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "Recurring job tick failed");
                    }
                }
            }
        }

        info!("Recurring job runner stopped");
    }

    /// Run every job once if this instance is primary.
    pub async fn tick(&self) -> Result<TickReport> {
        if !self.election.is_primary().await? {
            debug!("Not primary, skipping recurring jobs");
            return Ok(TickReport::NotPrimary);
        }

        let mut outcomes = Vec::with_capacity(self.jobs.len());
        for job in &self.jobs {
            let outcome = self.run_job(job.as_ref()).await?;
            outcomes.push((job.name().to_string(), outcome));
        }
        Ok(TickReport::Ran(outcomes))
    }

    async fn run_job(&self, job: &dyn RecurringJob) -> Result<JobTickOutcome> {
        let name = job.name();
        let account_id = job.account_id();

        let previous = self.persistence.get_job_permit(name, account_id).await?;
        if previous.as_ref().is_some_and(|p| p.disabled) {
            debug!(job = name, account_id, "Job disabled, skipping");
            return Ok(JobTickOutcome::Disabled);
        }
        let failures = previous
            .as_ref()
            .map(|p| u32::try_from(p.failure_count).unwrap_or(u32::MAX))
            .unwrap_or(0);

        let lease = to_chrono(self.backoff.lease_for(failures))?;
        let acquired = self
            .persistence
            .try_acquire_job_permit(name, account_id, Utc::now() + lease)
            .await?;
        if !acquired {
            debug!(job = name, account_id, "Job permit held, skipping");
            return Ok(JobTickOutcome::PermitHeld);
        }

        match job.run().await {
            Ok(()) => {
                self.persistence
                    .save_job_permit(&JobPermitRecord {
                        job_name: name.to_string(),
                        account_id: account_id.to_string(),
                        leased_until: Utc::now(),
                        failure_count: 0,
                        disabled: false,
                        last_error: None,
                        updated_at: Utc::now(),
                    })
                    .await?;
                if failures > 0 {
                    self.persistence
                        .set_alert_state(account_id, name, false, None)
                        .await?;
                    info!(job = name, account_id, "Job recovered");
                }
                debug!(job = name, account_id, "Job succeeded");
                Ok(JobTickOutcome::Succeeded)
            }
            Err(e) => {
                let failures = failures.saturating_add(1);
                let disabled = self.backoff.should_disable(failures);
                let message = format!("{:#}", e);
                let hold = to_chrono(self.backoff.lease_for(failures))?;

                self.persistence
                    .save_job_permit(&JobPermitRecord {
                        job_name: name.to_string(),
                        account_id: account_id.to_string(),
                        leased_until: Utc::now() + hold,
                        failure_count: i64::from(failures),
                        disabled,
                        last_error: Some(message.clone()),
                        updated_at: Utc::now(),
                    })
                    .await?;

                if disabled {
                    self.persistence
                        .set_alert_state(
                            account_id,
                            name,
                            true,
                            Some(&format!("disabled after {} failures: {}", failures, message)),
                        )
                        .await?;
                    error!(job = name, account_id, failures, error = %message, "Job disabled");
                } else {
                    warn!(job = name, account_id, failures, error = %message, "Job failed");
                }
                Ok(JobTickOutcome::Failed { failures, disabled })
            }
        }
    }
}

fn to_chrono(duration: Duration) -> Result<chrono::Duration> {
    chrono::Duration::from_std(duration)
        .map_err(|e| CoreError::validation("duration", format!("out of range: {}", e)))
}

/// Fails steps that are still awaiting a response past their deadline.
///
/// The deadline is the order's timeout plus a grace period, fixed when the
/// order was dispatched.
pub struct StepExpiryJob {
    orchestrator: Orchestrator,
    account_id: String,
    batch_size: i64,
}

impl StepExpiryJob {
    /// Job name.
    pub const NAME: &'static str = "step-expiry";

    /// Create the job.
    pub fn new(orchestrator: Orchestrator, account_id: impl Into<String>) -> Self {
        Self {
            orchestrator,
            account_id: account_id.into(),
            batch_size: 100,
        }
    }

    /// Override the batch size.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl RecurringJob for StepExpiryJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn run(&self) -> anyhow::Result<()> {
        self.orchestrator
            .expire_overdue(Utc::now(), self.batch_size)
            .await?;
        Ok(())
    }
}

/// Deletes runs finished longer ago than the retention period, with their
/// handoff records, step executions, activities and registrations.
///
/// Runs that were never finished are kept however old they are.
pub struct RunRetentionJob {
    persistence: Arc<dyn Persistence>,
    account_id: String,
    retention: Duration,
    batch_size: i64,
}

impl RunRetentionJob {
    /// Job name.
    pub const NAME: &'static str = "run-retention";

    /// Create the job.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        account_id: impl Into<String>,
        retention: Duration,
    ) -> Self {
        Self {
            persistence,
            account_id: account_id.into(),
            retention,
            batch_size: 500,
        }
    }

    /// Override the delete batch size.
    pub fn with_batch_size(mut self, batch_size: i64) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }
}

#[async_trait]
impl RecurringJob for RunRetentionJob {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn account_id(&self) -> &str {
        &self.account_id
    }

    async fn run(&self) -> anyhow::Result<()> {
        let cutoff = Utc::now() - to_chrono(self.retention)?;
        let mut total_deleted = 0u64;

        loop {
            let run_ids = self
                .persistence
                .finished_runs_older_than(cutoff, self.batch_size)
                .await?;
            if run_ids.is_empty() {
                break;
            }

            let batch_size = run_ids.len();
            let deleted = self.persistence.delete_runs(&run_ids).await?;
            total_deleted += deleted;
            debug!(batch_size, deleted, total_deleted, "Collected batch of finished runs");

            if (batch_size as i64) < self.batch_size {
                break;
            }
        }

        if total_deleted > 0 {
            info!(total_deleted, cutoff = %cutoff, "Finished runs collected");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_grows_exponentially_and_caps() {
        let backoff = JobBackoff {
            base_lease: Duration::from_secs(10),
            max_lease: Duration::from_secs(100),
            max_failures: 3,
        };
        assert_eq!(backoff.lease_for(0), Duration::from_secs(10));
        assert_eq!(backoff.lease_for(1), Duration::from_secs(20));
        assert_eq!(backoff.lease_for(3), Duration::from_secs(80));
        assert_eq!(backoff.lease_for(4), Duration::from_secs(100));
        assert_eq!(backoff.lease_for(64), Duration::from_secs(100));
    }

    #[test]
    fn test_should_disable() {
        let backoff = JobBackoff {
            max_failures: 3,
            ..JobBackoff::default()
        };
        assert!(!backoff.should_disable(2));
        assert!(backoff.should_disable(3));
    }

    #[tokio::test]
    async fn test_always_primary() {
        assert!(AlwaysPrimary.is_primary().await.unwrap());
    }
}
