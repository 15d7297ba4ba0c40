// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SQLite-backed persistence implementation.

use std::path::Path;

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use sqlx::sqlite::SqlitePoolOptions;

use crate::error::CoreError;

use super::{
    ActivityRecord, AlertStateRecord, AwaitingRecord, HandoffRecord, JobPermitRecord, Persistence,
    RunRecord, StepExecutionRecord,
};

/// Rows scoped to a run, cleared before the run row itself.
const RUN_SCOPED_DELETES: [&str; 4] = [
    "DELETE FROM handoff_records WHERE workflow_execution_id = ?",
    "DELETE FROM step_executions WHERE workflow_execution_id = ?",
    "DELETE FROM activities WHERE workflow_execution_id = ?",
    "DELETE FROM awaiting_steps WHERE workflow_execution_id = ?",
];

static MIGRATOR: sqlx::migrate::Migrator = sqlx::migrate!("./migrations/sqlite");

/// SQLite-backed persistence provider.
#[derive(Clone)]
pub struct SqlitePersistence {
    pool: SqlitePool,
}

impl SqlitePersistence {
    /// Create a new SQLite persistence provider from an existing pool.
    ///
    /// The caller is responsible for running [`SqlitePersistence::migrate`].
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Run the embedded migrations against the pool.
    pub async fn migrate(&self) -> Result<(), CoreError> {
        MIGRATOR
            .run(&self.pool)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "migrate".to_string(),
                details: format!("Failed to run migrations: {}", e),
            })
    }

    /// Connect to a SQLite URL and run migrations.
    pub async fn connect(url: &str) -> Result<Self, CoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .map_err(|e| CoreError::DatabaseError {
                operation: "connect".to_string(),
                details: format!("Failed to connect to SQLite at {}: {}", url, e),
            })?;

        let persistence = Self { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Create and initialize a new SQLite persistence from a file path.
    ///
    /// Creates parent directories and the database file if needed, then runs
    /// all migrations.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let persistence = SqlitePersistence::from_path(".data/shiftwise.db").await?;
    /// ```
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| CoreError::DatabaseError {
                operation: "create_dir".to_string(),
                details: format!("Failed to create directory {:?}: {}", parent, e),
            })?;
        }

        let url = format!("sqlite:{}?mode=rwc", path.to_string_lossy());
        Self::connect(&url).await
    }

    /// Private in-memory database, for embedding and tests.
    pub async fn in_memory() -> Result<Self, CoreError> {
        // one connection that never recycles, or the database vanishes
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        let persistence = Self { pool };
        persistence.migrate().await?;
        Ok(persistence)
    }

    /// Underlying pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait::async_trait]
impl Persistence for SqlitePersistence {
    async fn touch_run(&self, workflow_execution_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (workflow_execution_id, started_at)
            VALUES (?, ?)
            ON CONFLICT(workflow_execution_id) DO NOTHING
            "#,
        )
        .bind(workflow_execution_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn mark_run_finished(&self, workflow_execution_id: &str) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO workflow_runs (workflow_execution_id, started_at, finished_at)
            VALUES (?1, ?2, ?2)
            ON CONFLICT(workflow_execution_id) DO UPDATE SET
                finished_at = excluded.finished_at
            "#,
        )
        .bind(workflow_execution_id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_run(&self, workflow_execution_id: &str) -> Result<Option<RunRecord>, CoreError> {
        let record = sqlx::query_as::<_, RunRecord>(
            r#"
            SELECT workflow_execution_id, started_at, finished_at
            FROM workflow_runs
            WHERE workflow_execution_id = ?
            "#,
        )
        .bind(workflow_execution_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn finished_runs_older_than(
        &self,
        cutoff: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            r#"
            SELECT workflow_execution_id
            FROM workflow_runs
            WHERE finished_at IS NOT NULL AND finished_at < ?
            ORDER BY finished_at
            LIMIT ?
            "#,
        )
        .bind(cutoff)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn delete_runs(&self, workflow_execution_ids: &[String]) -> Result<u64, CoreError> {
        if workflow_execution_ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut deleted = 0u64;
        for id in workflow_execution_ids {
            for statement in RUN_SCOPED_DELETES {
                sqlx::query(statement).bind(id).execute(&mut *tx).await?;
            }
            deleted += sqlx::query("DELETE FROM workflow_runs WHERE workflow_execution_id = ?")
                .bind(id)
                .execute(&mut *tx)
                .await?
                .rows_affected();
        }
        tx.commit().await?;

        Ok(deleted)
    }

    async fn put_handoff(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
        payload: &str,
    ) -> Result<(), CoreError> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO handoff_records (workflow_execution_id, record_key, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(workflow_execution_id, record_key) DO UPDATE SET
                payload = excluded.payload,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(workflow_execution_id)
        .bind(record_key)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn insert_handoff_once(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
        payload: &str,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            r#"
            INSERT INTO handoff_records (workflow_execution_id, record_key, payload, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?4)
            ON CONFLICT(workflow_execution_id, record_key) DO NOTHING
            "#,
        )
        .bind(workflow_execution_id)
        .bind(record_key)
        .bind(payload)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_handoff(
        &self,
        workflow_execution_id: &str,
        record_key: &str,
    ) -> Result<Option<HandoffRecord>, CoreError> {
        let record = sqlx::query_as::<_, HandoffRecord>(
            r#"
            SELECT workflow_execution_id, record_key, payload, created_at, updated_at
            FROM handoff_records
            WHERE workflow_execution_id = ? AND record_key = ?
            "#,
        )
        .bind(workflow_execution_id)
        .bind(record_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn purge_run_handoffs(&self, workflow_execution_id: &str) -> Result<u64, CoreError> {
        let result = sqlx::query("DELETE FROM handoff_records WHERE workflow_execution_id = ?")
            .bind(workflow_execution_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn insert_step_execution(&self, record: &StepExecutionRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO step_executions (
                activity_id, workflow_execution_id, step_name, command, direction,
                status, data, error_message, failure_type, created_at, finished_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.activity_id)
        .bind(&record.workflow_execution_id)
        .bind(&record.step_name)
        .bind(&record.command)
        .bind(&record.direction)
        .bind(&record.status)
        .bind(&record.data)
        .bind(&record.error_message)
        .bind(&record.failure_type)
        .bind(record.created_at)
        .bind(record.finished_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_step_execution(
        &self,
        activity_id: &str,
    ) -> Result<Option<StepExecutionRecord>, CoreError> {
        let record = sqlx::query_as::<_, StepExecutionRecord>(
            r#"
            SELECT activity_id, workflow_execution_id, step_name, command, direction,
                   status, data, error_message, failure_type, created_at, finished_at
            FROM step_executions
            WHERE activity_id = ?
            "#,
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn finalize_step_execution_if_pending(
        &self,
        activity_id: &str,
        status: &str,
        data: &str,
        error_message: Option<&str>,
        failure_type: Option<&str>,
    ) -> Result<bool, CoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE step_executions
            SET status = ?1,
                data = ?2,
                error_message = ?3,
                failure_type = ?4,
                finished_at = ?5
            WHERE activity_id = ?6
              AND status = 'pending'
            "#,
        )
        .bind(status)
        .bind(data)
        .bind(error_message)
        .bind(failure_type)
        .bind(now)
        .bind(activity_id)
        .execute(&mut *tx)
        .await?;
        let applied = result.rows_affected() > 0;

        if applied {
            sqlx::query("UPDATE activities SET status = ?, updated_at = ? WHERE activity_id = ?")
                .bind(status)
                .bind(now)
                .bind(activity_id)
                .execute(&mut *tx)
                .await?;
        }

        // a registration outliving a terminal step is stale either way
        sqlx::query("DELETE FROM awaiting_steps WHERE correlation_id = ?")
            .bind(activity_id)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(applied)
    }

    async fn insert_activity(&self, record: &ActivityRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO activities (
                activity_id, workflow_execution_id, account_id, app_id, service_id,
                command_name, command_units, status, created_at, updated_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&record.activity_id)
        .bind(&record.workflow_execution_id)
        .bind(&record.account_id)
        .bind(&record.app_id)
        .bind(&record.service_id)
        .bind(&record.command_name)
        .bind(&record.command_units)
        .bind(&record.status)
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_activity(&self, activity_id: &str) -> Result<Option<ActivityRecord>, CoreError> {
        let record = sqlx::query_as::<_, ActivityRecord>(
            r#"
            SELECT activity_id, workflow_execution_id, account_id, app_id, service_id,
                   command_name, command_units, status, created_at, updated_at
            FROM activities
            WHERE activity_id = ?
            "#,
        )
        .bind(activity_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn register_awaiting(
        &self,
        correlation_id: &str,
        workflow_execution_id: &str,
        payload: &str,
        work_order: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO awaiting_steps (
                correlation_id, workflow_execution_id, payload, work_order, created_at, expires_at
            )
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(correlation_id) DO NOTHING
            "#,
        )
        .bind(correlation_id)
        .bind(workflow_execution_id)
        .bind(payload)
        .bind(work_order)
        .bind(Utc::now())
        .bind(expires_at)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(CoreError::DuplicateCorrelation {
                correlation_id: correlation_id.to_string(),
            });
        }
        Ok(())
    }

    async fn claim_awaiting(
        &self,
        correlation_id: &str,
        claimed_until: DateTime<Utc>,
    ) -> Result<Option<AwaitingRecord>, CoreError> {
        let record = sqlx::query_as::<_, AwaitingRecord>(
            r#"
            UPDATE awaiting_steps
            SET claimed_until = ?1
            WHERE correlation_id = ?2
              AND (claimed_until IS NULL OR claimed_until <= ?3)
            RETURNING correlation_id, workflow_execution_id, payload, work_order,
                      created_at, expires_at, claimed_until
            "#,
        )
        .bind(claimed_until)
        .bind(correlation_id)
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn release_awaiting(&self, correlation_id: &str) -> Result<(), CoreError> {
        sqlx::query("UPDATE awaiting_steps SET claimed_until = NULL WHERE correlation_id = ?")
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn remove_awaiting(&self, correlation_id: &str) -> Result<bool, CoreError> {
        let result = sqlx::query("DELETE FROM awaiting_steps WHERE correlation_id = ?")
            .bind(correlation_id)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn list_unclaimed_awaiting(
        &self,
        limit: i64,
    ) -> Result<Vec<AwaitingRecord>, CoreError> {
        let records = sqlx::query_as::<_, AwaitingRecord>(
            r#"
            SELECT correlation_id, workflow_execution_id, payload, work_order,
                   created_at, expires_at, claimed_until
            FROM awaiting_steps
            WHERE claimed_until IS NULL OR claimed_until <= ?
            ORDER BY created_at
            LIMIT ?
            "#,
        )
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_expired_awaiting(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<AwaitingRecord>, CoreError> {
        let records = sqlx::query_as::<_, AwaitingRecord>(
            r#"
            SELECT correlation_id, workflow_execution_id, payload, work_order,
                   created_at, expires_at, claimed_until
            FROM awaiting_steps
            WHERE expires_at <= ?1
              AND (claimed_until IS NULL OR claimed_until <= ?2)
            ORDER BY expires_at
            LIMIT ?3
            "#,
        )
        .bind(as_of)
        .bind(Utc::now())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(records)
    }

    async fn list_run_awaiting(
        &self,
        workflow_execution_id: &str,
    ) -> Result<Vec<String>, CoreError> {
        let ids: Vec<(String,)> = sqlx::query_as(
            "SELECT correlation_id FROM awaiting_steps WHERE workflow_execution_id = ? ORDER BY created_at",
        )
        .bind(workflow_execution_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(ids.into_iter().map(|(id,)| id).collect())
    }

    async fn count_awaiting(&self) -> Result<i64, CoreError> {
        let count: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM awaiting_steps")
            .fetch_one(&self.pool)
            .await?;

        Ok(count.0)
    }

    async fn try_acquire_lease(
        &self,
        name: &str,
        holder: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO leases (name, holder, expires_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE leases.holder = excluded.holder OR leases.expires_at <= ?4
            "#,
        )
        .bind(name)
        .bind(holder)
        .bind(expires_at)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn try_acquire_job_permit(
        &self,
        job_name: &str,
        account_id: &str,
        leased_until: DateTime<Utc>,
    ) -> Result<bool, CoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO job_permits (job_name, account_id, leased_until, failure_count, disabled, updated_at)
            VALUES (?1, ?2, ?3, 0, 0, ?4)
            ON CONFLICT(job_name, account_id) DO UPDATE SET
                leased_until = excluded.leased_until,
                updated_at = excluded.updated_at
            WHERE job_permits.leased_until <= ?4 AND job_permits.disabled = 0
            "#,
        )
        .bind(job_name)
        .bind(account_id)
        .bind(leased_until)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn get_job_permit(
        &self,
        job_name: &str,
        account_id: &str,
    ) -> Result<Option<JobPermitRecord>, CoreError> {
        let record = sqlx::query_as::<_, JobPermitRecord>(
            r#"
            SELECT job_name, account_id, leased_until, failure_count, disabled, last_error, updated_at
            FROM job_permits
            WHERE job_name = ? AND account_id = ?
            "#,
        )
        .bind(job_name)
        .bind(account_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    async fn save_job_permit(&self, record: &JobPermitRecord) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_permits (job_name, account_id, leased_until, failure_count, disabled, last_error, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(job_name, account_id) DO UPDATE SET
                leased_until = excluded.leased_until,
                failure_count = excluded.failure_count,
                disabled = excluded.disabled,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.job_name)
        .bind(&record.account_id)
        .bind(record.leased_until)
        .bind(record.failure_count)
        .bind(record.disabled)
        .bind(&record.last_error)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn set_alert_state(
        &self,
        account_id: &str,
        alert_type: &str,
        is_open: bool,
        message: Option<&str>,
    ) -> Result<(), CoreError> {
        sqlx::query(
            r#"
            INSERT INTO alert_states (account_id, alert_type, is_open, message, updated_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(account_id, alert_type) DO UPDATE SET
                is_open = excluded.is_open,
                message = excluded.message,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(account_id)
        .bind(alert_type)
        .bind(is_open)
        .bind(message)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_alert_state(
        &self,
        account_id: &str,
        alert_type: &str,
    ) -> Result<Option<AlertStateRecord>, CoreError> {
        let record = sqlx::query_as::<_, AlertStateRecord>(
            r#"
            SELECT account_id, alert_type, is_open, message, updated_at
            FROM alert_states
            WHERE account_id = ? AND alert_type = ?
            "#,
        )
        .bind(account_id)
        .bind(alert_type)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }
}
