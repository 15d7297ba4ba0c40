// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator facade used by the workflow engine.
//!
//! The workflow engine calls [`Orchestrator::execute`] for each step and
//! forwards worker responses to [`Orchestrator::handle_response`]. Neither
//! call blocks on a remote operation.
//!
//! Everything needed to resume lives in the database, so any orchestrator
//! over the same database can take the response, including one started after
//! the process that dispatched the order is gone.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use shiftwise_protocol::{FailureType, TaskResponse};
use tracing::{info, instrument, warn};

use crate::dispatcher::{CorrelationId, Dispatcher, TaskQueue};
use crate::error::{CoreError, StepError};
use crate::handoff::HandoffStore;
use crate::persistence::Persistence;
use crate::run::WorkflowRunContext;
use crate::step::{
    AwaitingStep, Execution, PendingStep, StepExecutionData, StepOutcome, StepServices, StepSpec,
};

/// Default remote timeout in minutes.
pub const DEFAULT_TIMEOUT_MINUTES: u32 = 10;

/// Entry point for step execution and response handling.
#[derive(Clone)]
pub struct Orchestrator {
    services: StepServices,
}

impl Orchestrator {
    /// Create an orchestrator over a persistence backend and a task queue.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        queue: Arc<dyn TaskQueue>,
        default_timeout_minutes: u32,
    ) -> Self {
        Self {
            services: StepServices {
                handoff: HandoffStore::new(persistence.clone()),
                dispatcher: Dispatcher::new(persistence.clone(), queue),
                persistence,
                default_timeout_minutes,
            },
        }
    }

    /// Handoff store of this orchestrator.
    pub fn handoff(&self) -> &HandoffStore {
        &self.services.handoff
    }

    /// Run a step until it suspends or completes.
    pub async fn execute(
        &self,
        run: &WorkflowRunContext,
        spec: StepSpec,
    ) -> Result<Execution, StepError> {
        PendingStep::new(spec).execute(&self.services, run).await
    }

    /// Resume the step awaiting `response`.
    ///
    /// Returns `Ok(None)` when no step is waiting on the correlation id: the
    /// response is late, duplicated, another delivery is applying it, or the
    /// step was abandoned. If applying the response fails before the step's
    /// terminal status is written, the step stays registered and a
    /// redelivery of the same response resumes it.
    #[instrument(skip_all, fields(correlation_id = %response.correlation_id))]
    pub async fn handle_response(
        &self,
        response: TaskResponse,
    ) -> Result<Option<StepOutcome>, StepError> {
        let correlation_id = CorrelationId::from(response.correlation_id.clone());
        let Some(step) = self
            .services
            .dispatcher
            .claim::<AwaitingStep>(&correlation_id)
            .await?
        else {
            warn!("No step awaiting this correlation id, response ignored");
            return Ok(None);
        };

        match step.on_response(&self.services, response).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.release(&correlation_id).await;
                Err(e)
            }
        }
    }

    /// Cancel an awaiting step. A response arriving later is ignored.
    #[instrument(skip(self))]
    pub async fn abandon(
        &self,
        correlation_id: &CorrelationId,
        reason: &str,
    ) -> Result<Option<StepOutcome>, StepError> {
        let Some(step) = self
            .services
            .dispatcher
            .claim::<AwaitingStep>(correlation_id)
            .await?
        else {
            return Ok(None);
        };

        match step.abandon(&self.services, reason).await {
            Ok(outcome) => Ok(Some(outcome)),
            Err(e) => {
                self.release(correlation_id).await;
                Err(e.into())
            }
        }
    }

    async fn release(&self, correlation_id: &CorrelationId) {
        // a committed terminal status already removed the row
        if let Err(e) = self.services.dispatcher.release(correlation_id).await {
            warn!(%correlation_id, error = %e, "Failed to release claim, it will expire");
        }
    }

    /// Send again the orders of every step still awaiting a response.
    ///
    /// Called on startup: orders queued in memory by a previous process are
    /// gone, their registrations are not.
    pub async fn redeliver_outstanding(&self) -> Result<usize, CoreError> {
        const BATCH: i64 = 1000;
        self.services.dispatcher.redeliver(BATCH).await
    }

    /// Fail with a timeout every step whose deadline passed by `as_of`.
    ///
    /// Returns the number of steps failed.
    pub async fn expire_overdue(
        &self,
        as_of: DateTime<Utc>,
        limit: i64,
    ) -> Result<usize, StepError> {
        let overdue = self.services.dispatcher.overdue(as_of, limit).await?;
        let mut expired = 0;
        for order in overdue {
            let response = TaskResponse::failure(
                order.activity_id.as_str(),
                FailureType::Timeout,
                format!(
                    "no response from worker within {} minutes",
                    order.timeout_minutes
                ),
            );
            match self.handle_response(response).await {
                Ok(Some(_)) => expired += 1,
                Ok(None) => {}
                Err(e) => {
                    warn!(activity_id = %order.activity_id, error = %e, "Failed to expire step");
                }
            }
        }
        if expired > 0 {
            warn!(expired, "Overdue steps failed with a timeout");
        }
        Ok(expired)
    }

    /// Persisted execution data of a step.
    pub async fn step_execution(
        &self,
        activity_id: &str,
    ) -> Result<Option<StepExecutionData>, CoreError> {
        match self
            .services
            .persistence
            .get_step_execution(activity_id)
            .await?
        {
            Some(record) => Ok(Some(serde_json::from_str(&record.data)?)),
            None => Ok(None),
        }
    }

    /// Number of steps waiting for a response.
    pub async fn outstanding(&self) -> Result<i64, CoreError> {
        self.services.dispatcher.outstanding().await
    }

    /// Close a run: abandon its awaiting steps, drop its handoff records and
    /// mark it finished so retention can collect the rest.
    ///
    /// Returns the number of handoff records removed.
    #[instrument(skip_all, fields(workflow_execution_id = %run.workflow_execution_id))]
    pub async fn finish_run(&self, run: &WorkflowRunContext) -> Result<u64, StepError> {
        let registered = self
            .services
            .dispatcher
            .registered_for_run(&run.workflow_execution_id)
            .await?;
        let mut abandoned = 0;
        for correlation_id in &registered {
            if self.abandon(correlation_id, "workflow run finished").await?.is_some() {
                abandoned += 1;
            }
        }

        let removed = self.services.handoff.purge_run(run).await?;
        self.services
            .persistence
            .mark_run_finished(&run.workflow_execution_id)
            .await?;
        info!(removed, abandoned, "Run finished");
        Ok(removed)
    }
}
