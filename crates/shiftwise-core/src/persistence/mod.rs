// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for shiftwise-core.
//!
//! Everything a step needs to survive a restart lives behind [`Persistence`]:
//! run bookkeeping, handoff records, step execution data, activities,
//! awaiting registrations (with the work order that was sent), and the
//! lease/permit/alert rows used by the recurring job runner.

pub mod sqlite;

pub use self::sqlite::SqlitePersistence;

use chrono::{DateTime, Utc};

use crate::error::CoreError;

/// Lifecycle row of a workflow run.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RunRecord {
    /// Run id.
    pub workflow_execution_id: String,
    /// First dispatch of the run.
    pub started_at: DateTime<Utc>,
    /// Set by `finish_run`; only finished runs are collected.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Handoff record from the persistence layer.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct HandoffRecord {
    /// Run the record is scoped to.
    pub workflow_execution_id: String,
    /// Prefix + trimmed service id.
    pub record_key: String,
    /// JSON payload.
    pub payload: String,
    /// When the record was first written.
    pub created_at: DateTime<Utc>,
    /// When the record was last overwritten.
    pub updated_at: DateTime<Utc>,
}

/// Persisted step execution data.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StepExecutionRecord {
    /// Activity id, also the correlation id.
    pub activity_id: String,
    /// Run the step belongs to.
    pub workflow_execution_id: String,
    /// Step name from the workflow definition.
    pub step_name: String,
    /// Remote command name.
    pub command: String,
    /// forward or rollback.
    pub direction: String,
    /// pending, success, failed, skipped.
    pub status: String,
    /// JSON of the full execution data.
    pub data: String,
    /// Error reported on failure.
    pub error_message: Option<String>,
    /// Failure classification on failure.
    pub failure_type: Option<String>,
    /// When the step started.
    pub created_at: DateTime<Utc>,
    /// When the step reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Activity row shown in the activity log.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ActivityRecord {
    /// Activity id.
    pub activity_id: String,
    /// Run the activity belongs to.
    pub workflow_execution_id: String,
    /// Owning account.
    pub account_id: String,
    /// Owning application.
    pub app_id: String,
    /// Service being deployed.
    pub service_id: String,
    /// Remote command name.
    pub command_name: String,
    /// JSON array of command unit names.
    pub command_units: String,
    /// running, success, failed, skipped.
    pub status: String,
    /// When the activity was created.
    pub created_at: DateTime<Utc>,
    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

/// Durable registration of a step awaiting a worker response.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AwaitingRecord {
    /// Correlation id of the outstanding work order.
    pub correlation_id: String,
    /// Run the step belongs to.
    pub workflow_execution_id: String,
    /// JSON of the suspended step.
    pub payload: String,
    /// JSON of the work order, resent until the step finishes.
    pub work_order: String,
    /// When the order was submitted.
    pub created_at: DateTime<Utc>,
    /// After this instant the step is failed with a timeout.
    pub expires_at: DateTime<Utc>,
    /// Set while a response is being applied.
    pub claimed_until: Option<DateTime<Utc>>,
}

/// Per-account permit of a recurring job.
#[derive(Debug, Clone, PartialEq, sqlx::FromRow)]
pub struct JobPermitRecord {
    /// Job name.
    pub job_name: String,
    /// Account the job runs for.
    pub account_id: String,
    /// Permit is held until this instant.
    pub leased_until: DateTime<Utc>,
    /// Consecutive failures.
    pub failure_count: i64,
    /// Disabled after too many failures.
    pub disabled: bool,
    /// Last failure message.
    pub last_error: Option<String>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Per-account alert row.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct AlertStateRecord {
    /// Owning account.
    pub account_id: String,
    /// Alert kind, e.g. the job name.
    pub alert_type: String,
    /// Whether the alert is currently open.
    pub is_open: bool,
    /// Reason the alert was opened.
    pub message: Option<String>,
    /// Last change.
    pub updated_at: DateTime<Utc>,
}

/// Persistence abstraction used by the orchestrator.
#[async_trait::async_trait]
pub trait Persistence: Send + Sync {
    /// Record the start of a run. No-op if the run is known.
    async fn touch_run(&self, workflow_execution_id: &str) -> Result<(), CoreError>;

    /// Mark a run finished, creating the row if needed.
    async fn mark_run_finished(&self, workflow_execution_id: &str) -> Result<(), CoreError>;

    /// Read a run.
    async fn get_run(&self, workflow_execution_id: &str) -> Result<Option<RunRecord>, CoreError>;

    /// Ids of at most `limit` runs finished before `cutoff`, oldest first.
    async fn finished_runs_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError>;

    /// Delete runs and every row scoped to them. Returns the runs removed.
    async fn delete_runs(&self, workflow_execution_ids: &[String]) -> Result<u64, CoreError>;

    /// Insert or overwrite a handoff record.
    async fn put_handoff(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
        payload: &str,
    ) -> Result<(), CoreError>;

    /// Insert a handoff record unless it exists. Returns whether it was written.
    async fn insert_handoff_once(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
        payload: &str,
    ) -> Result<bool, CoreError>;

    /// Read a handoff record.
    async fn get_handoff(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
    ) -> Result<Option<HandoffRecord>, CoreError>;

    /// Delete every handoff record of a run.
    async fn purge_run_handoffs(&self, workflow_execution_id: &str) -> Result<u64, CoreError>;

    /// Store a new step execution in `pending` status.
    async fn insert_step_execution(&self, record: &StepExecutionRecord) -> Result<(), CoreError>;

    /// Read a step execution.
    async fn get_step_execution(
        &self,
        activity_id: &str,
    ) -> Result<Option<StepExecutionRecord>, CoreError>;

    /// Move a step execution to a terminal status if it is still pending.
    ///
    /// In the same transaction the activity takes the status and the
    /// awaiting registration is removed. Returns `true` if the transition
    /// was applied.
    async fn finalize_step_execution_if_pending(
        &self,
        activity_id: &str,
        status: &str,
        data: &str,
        error_message: Option<&str>,
        failure_type: Option<&str>,
    ) -> Result<bool, CoreError>;

    /// Store a new activity.
    async fn insert_activity(&self, record: &ActivityRecord) -> Result<(), CoreError>;

    /// Read an activity.
    async fn get_activity(&self, activity_id: &str) -> Result<Option<ActivityRecord>, CoreError>;

    /// Register a step awaiting a response.
    ///
    /// Fails with [`CoreError::DuplicateCorrelation`] if the id is taken.
    async fn register_awaiting(
        &self,
        correlation_id: &str,
        workflow_execution_id: &str,
        payload: &str,
        work_order: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError>;

    /// Claim a registration until `claimed_until`.
    ///
    /// Fails to claim (`None`) while another claim is live. The row stays
    /// until the terminal status commits, so an expired or released claim
    /// can be taken again.
    async fn claim_awaiting(
        &self,
        correlation_id: &str,
        claimed_until: DateTime<Utc>,
    ) -> Result<Option<AwaitingRecord>, CoreError>;

    /// Drop the claim on a registration that is still present.
    async fn release_awaiting(&self, correlation_id: &str) -> Result<(), CoreError>;

    /// Delete a registration outright. Returns whether it existed.
    async fn remove_awaiting(&self, correlation_id: &str) -> Result<bool, CoreError>;

    /// Unclaimed registrations, oldest first.
    async fn list_unclaimed_awaiting(&self, limit: i64)
    -> Result<Vec<AwaitingRecord>, CoreError>;

    /// Unclaimed registrations that expired at or before `as_of`.
    async fn list_expired_awaiting(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AwaitingRecord>, CoreError>;

    /// Correlation ids registered for a run.
    async fn list_run_awaiting(&self, workflow_execution_id: &str)
    -> Result<Vec<String>, CoreError>;

    /// Number of outstanding registrations.
    async fn count_awaiting(&self) -> Result<i64, CoreError>;

    /// Acquire or renew a named lease for `holder`.
    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Take a job permit if it is free and the job is not disabled.
    async fn try_acquire_job_permit(
        &self,
        job_name: &str,
        account_id: &str,
        leased_until: DateTime<Utc>,
    ) -> Result<bool, CoreError>;

    /// Read a job permit.
    async fn get_job_permit(
        &self,
        job_name: &str,
        account_id: &str,
    ) -> Result<Option<JobPermitRecord>, CoreError>;

    /// Overwrite a job permit.
    async fn save_job_permit(&self, record: &JobPermitRecord) -> Result<(), CoreError>;

    /// Open or close an alert.
    async fn set_alert_state(
        &self,
        account_id: &str,
        alert_type: &str,
        is_open: bool,
        message: Option<&str>,
    ) -> Result<(), CoreError>;

    /// Read an alert.
    async fn get_alert_state(
        &self,
        account_id: &str,
        alert_type: &str,
    ) -> Result<Option<AlertStateRecord>, CoreError>;
}
