// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Step controller.
//!
//! One state machine drives every scaling-group step:
//!
//! ```text
//! PendingStep ──execute──► AwaitingStep ──on_response──► StepOutcome
//!      │                    (persisted, keyed by
//!      └──► StepOutcome      correlation id)
//!           (skipped / short-circuited)
//! ```
//!
//! What differs between setup, deploy and listener steps is data:
//! [`StepKind`] carries the parameters and [`DirectionPolicy`] says whether
//! the step runs forward or as a rollback. Rollbacks never recompute state;
//! they read the frozen setup record.

mod deploy;
mod listener;
mod setup;

use std::fmt::Write as _;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use shiftwise_protocol::{
    Capacity, FailureType, InstanceUnit, LoadBalancerWiring, OperationParams, ResizeStrategy,
    ScalingGroupConfig, TaskCommand, TaskResponse, WorkOrder,
};
use tracing::{Instrument, info, info_span, warn};

use crate::dispatcher::{CorrelationId, Dispatcher, ResponseOutcome, classify};
use crate::error::{CoreError, Result, StepError};
use crate::handoff::{HandoffStore, SetupContextRecord};
use crate::persistence::{ActivityRecord, Persistence, StepExecutionRecord};
use crate::planner::InstanceRequest;
use crate::run::WorkflowRunContext;
use crate::tracker::CommandUnit;

/// Forward or rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    /// Normal deployment path.
    Forward,
    /// Mirror of the forward path, sourced from the setup record.
    Rollback,
}

impl Direction {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Forward => "forward",
            Self::Rollback => "rollback",
        }
    }
}

/// How a step variant behaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectionPolicy {
    /// Forward or rollback.
    pub direction: Direction,
    /// Blue/green run.
    pub blue_green: bool,
}

impl DirectionPolicy {
    /// Whether this is a rollback.
    pub fn is_rollback(&self) -> bool {
        self.direction == Direction::Rollback
    }
}

/// Lifecycle status of a step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    /// Dispatched, waiting for the worker.
    Pending,
    /// Finished successfully.
    Success,
    /// Finished with a failure.
    Failed,
    /// Nothing to do, or abandoned.
    Skipped,
}

impl StepStatus {
    /// Stored name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }

    /// Whether no further transition is allowed.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// Capacity the new group gets at setup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum InitialCapacity {
    /// Explicit full-scale capacity.
    Fixed {
        /// Full-scale capacity.
        capacity: Capacity,
    },
    /// Copy the capacity of the currently running group.
    UseCurrentRunning {
        /// Used when no group is running.
        fallback: Capacity,
    },
}

/// Parameters of a setup step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupParams {
    /// Prefix of the new group's name.
    pub name_prefix: String,
    /// Cloud region.
    pub region: String,
    /// Blue/green deployment.
    pub blue_green: bool,
    /// Requested resize order.
    pub resize_strategy: ResizeStrategy,
    /// Full-scale capacity of the new group.
    pub initial_capacity: InitialCapacity,
    /// Listener wiring, required for blue/green.
    pub load_balancers: Vec<LoadBalancerWiring>,
}

/// Parameters of a deploy phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployParams {
    /// Size of the new group after this phase.
    pub upsize: InstanceRequest,
    /// Explicit size of the old group after this phase.
    pub downsize_override: Option<InstanceRequest>,
}

/// Parameters of a listener switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerParams {
    /// Drain the old group after the swap.
    pub downsize_old: bool,
    /// Weighted shift instead of a full swap.
    pub traffic_weight: Option<u8>,
}

/// Step family and its parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepKind {
    /// Create the new group and freeze the setup record.
    Setup(SetupParams),
    /// Resize new and old groups for one phase.
    Deploy(DeployParams),
    /// Swap or shift listener traffic.
    ListenerSwitch(ListenerParams),
}

/// A step as defined in the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Name shown in the workflow.
    pub step_name: String,
    /// Family and parameters.
    pub kind: StepKind,
    /// Forward or rollback.
    pub direction: Direction,
    /// Remote timeout; falls back to the setup record, then the default.
    pub timeout_minutes: Option<u32>,
}

impl StepSpec {
    /// Forward step.
    pub fn forward(step_name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_name: step_name.into(),
            kind,
            direction: Direction::Forward,
            timeout_minutes: None,
        }
    }

    /// Rollback step.
    pub fn rollback(step_name: impl Into<String>, kind: StepKind) -> Self {
        Self {
            step_name: step_name.into(),
            kind,
            direction: Direction::Rollback,
            timeout_minutes: None,
        }
    }

    /// Override the remote timeout.
    pub fn with_timeout(mut self, minutes: u32) -> Self {
        self.timeout_minutes = Some(minutes);
        self
    }
}

/// Execution data persisted per step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepExecutionData {
    /// Activity id, also the correlation id.
    pub activity_id: String,
    /// Run the step belongs to.
    pub workflow_execution_id: String,
    /// Step name.
    pub step_name: String,
    /// Remote command.
    pub command: TaskCommand,
    /// Forward or rollback.
    pub direction: Direction,
    /// Blue/green run.
    pub blue_green: bool,
    /// Remote timeout in minutes.
    pub timeout_minutes: u32,
    /// New group id.
    pub new_group_id: Option<String>,
    /// New group name.
    pub new_group_name: Option<String>,
    /// Old group id.
    pub old_group_id: Option<String>,
    /// Old group name.
    pub old_group_name: Option<String>,
    /// Requested new group capacity.
    pub new_group_capacity: Option<Capacity>,
    /// Requested old group capacity.
    pub old_group_capacity: Option<Capacity>,
    /// Traffic weight requested or applied.
    pub traffic_weight: Option<u8>,
    /// Sub-phases shown on the activity.
    pub command_units: Vec<CommandUnit>,
    /// Instances launched by the step.
    pub new_instance_ids: Vec<String>,
    /// Current status.
    pub status: StepStatus,
    /// Error message on failure.
    pub error_message: Option<String>,
    /// Failure classification on failure.
    pub failure_type: Option<FailureType>,
}

impl StepExecutionData {
    fn set_groups(&mut self, new: Option<&ScalingGroupConfig>, old: Option<&ScalingGroupConfig>) {
        if let Some(new) = new {
            self.new_group_id = Some(new.id.clone());
            self.new_group_name = Some(new.name.clone());
            self.new_group_capacity = Some(new.capacity);
        }
        if let Some(old) = old {
            self.old_group_id = Some(old.id.clone());
            self.old_group_name = Some(old.name.clone());
            self.old_group_capacity = Some(old.capacity);
        }
    }

    /// Desired instance count of the new group.
    pub fn new_group_desired(&self) -> Option<u32> {
        self.new_group_capacity.map(|c| c.target)
    }

    /// Desired instance count of the old group.
    pub fn old_group_desired(&self) -> Option<u32> {
        self.old_group_capacity.map(|c| c.target)
    }

    /// One-line human-readable summary.
    pub fn summary(&self) -> String {
        let mut out = format!(
            "{} [{} {}]",
            self.step_name,
            self.command.as_str(),
            self.direction.as_str()
        );
        let group = |name: &Option<String>, id: &Option<String>, cap: &Option<Capacity>| {
            let label = match (name, id) {
                (Some(name), Some(id)) => format!("{} ({})", name, id),
                (Some(name), None) => name.clone(),
                (None, Some(id)) => id.clone(),
                (None, None) => "-".to_string(),
            };
            match cap {
                Some(c) => format!("{} -> {}", label, c.target),
                None => label,
            }
        };
        if self.new_group_id.is_some() || self.new_group_name.is_some() {
            let _ = write!(
                out,
                ": new group {}",
                group(&self.new_group_name, &self.new_group_id, &self.new_group_capacity)
            );
        }
        if self.old_group_id.is_some() || self.old_group_name.is_some() {
            let _ = write!(
                out,
                ", old group {}",
                group(&self.old_group_name, &self.old_group_id, &self.old_group_capacity)
            );
        }
        if let Some(weight) = self.traffic_weight {
            let _ = write!(out, ", traffic {}%", weight);
        }
        let _ = write!(out, "; status {}", self.status.as_str());
        if let Some(failure) = self.failure_type {
            let _ = write!(out, " ({})", failure.as_str());
        }
        if let Some(message) = &self.error_message {
            let _ = write!(out, ": {}", message);
        }
        out
    }
}

/// Result of a step that reached a terminal status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StepOutcome {
    /// Terminal status.
    pub status: StepStatus,
    /// Failure classification on failure.
    pub failure_type: Option<FailureType>,
    /// Error message on failure.
    pub error_message: Option<String>,
    /// Succeeded without dispatching because the work was already done.
    pub short_circuited: bool,
    /// Execution data, absent when no work order was ever created.
    pub data: Option<StepExecutionData>,
}

impl StepOutcome {
    fn skipped(message: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Skipped,
            failure_type: None,
            error_message: Some(message.into()),
            short_circuited: false,
            data: None,
        }
    }

    fn already_done() -> Self {
        Self {
            status: StepStatus::Success,
            failure_type: None,
            error_message: None,
            short_circuited: true,
            data: None,
        }
    }

    fn from_data(data: StepExecutionData) -> Self {
        Self {
            status: data.status,
            failure_type: data.failure_type,
            error_message: data.error_message.clone(),
            short_circuited: false,
            data: Some(data),
        }
    }

    /// Whether the step succeeded.
    pub fn is_success(&self) -> bool {
        self.status == StepStatus::Success
    }
}

/// What `execute` returned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Execution {
    /// A work order is out; resume with the response.
    Suspended {
        /// Correlation id of the order.
        correlation_id: CorrelationId,
    },
    /// Finished without a remote call.
    Completed(StepOutcome),
}

/// Collaborators a step needs.
#[derive(Clone)]
pub struct StepServices {
    /// Durable storage.
    pub persistence: Arc<dyn Persistence>,
    /// Handoff records.
    pub handoff: HandoffStore,
    /// Outbound orders and correlation.
    pub dispatcher: Dispatcher,
    /// Remote timeout when neither the step nor the setup record sets one.
    pub default_timeout_minutes: u32,
}

/// Kind-specific plan, turned into a work order by the controller.
pub(crate) struct Prepared {
    pub(crate) blue_green: bool,
    pub(crate) command: TaskCommand,
    pub(crate) region: String,
    pub(crate) timeout_minutes: u32,
    pub(crate) new_group: Option<ScalingGroupConfig>,
    pub(crate) old_group: Option<ScalingGroupConfig>,
    pub(crate) operation: OperationParams,
    pub(crate) units: Vec<CommandUnit>,
    pub(crate) traffic_weight: Option<u8>,
}

/// A step that has not run yet.
#[derive(Debug, Clone)]
pub struct PendingStep {
    spec: StepSpec,
}

impl PendingStep {
    /// Wrap a step definition.
    pub fn new(spec: StepSpec) -> Self {
        Self { spec }
    }

    /// Validate, plan, record and dispatch.
    ///
    /// Returns [`Execution::Suspended`] once the order is queued, or
    /// [`Execution::Completed`] when there is nothing to dispatch.
    pub async fn execute(
        self,
        services: &StepServices,
        run: &WorkflowRunContext,
    ) -> std::result::Result<Execution, StepError> {
        let span = info_span!(
            "step_execute",
            workflow_execution_id = %run.workflow_execution_id,
            service_id = %run.service_id,
            step_name = %self.spec.step_name,
            direction = self.spec.direction.as_str(),
        );
        self.execute_inner(services, run)
            .instrument(span)
            .await
            .map_err(StepError::from)
    }

    async fn execute_inner(
        self,
        services: &StepServices,
        run: &WorkflowRunContext,
    ) -> Result<Execution> {
        let direction = self.spec.direction;

        if direction == Direction::Forward {
            self.validate()?;
        }

        if let (StepKind::Deploy(_), Direction::Rollback) = (&self.spec.kind, direction)
            && deploy::rollback_already_done(&services.handoff, run).await?
        {
            info!("All-phase rollback already completed, nothing to do");
            return Ok(Execution::Completed(StepOutcome::already_done()));
        }

        let setup_record = services.handoff.setup_record(run).await?;
        let timeout = self.spec.timeout_minutes;
        let default_timeout = services.default_timeout_minutes;
        let resolve_timeout = |record: &SetupContextRecord| timeout.unwrap_or(record.timeout_minutes);

        let prepared = match (&self.spec.kind, direction, setup_record) {
            (StepKind::Setup(params), Direction::Forward, None) => {
                setup::prepare_forward(params, timeout.unwrap_or(default_timeout))
            }
            (StepKind::Setup(_), Direction::Forward, Some(_)) => {
                return Err(CoreError::validation(
                    "service_id",
                    format!("setup already completed for service '{}'", run.service_id.trim()),
                ));
            }
            (_, Direction::Rollback, None) => {
                info!("No setup record found, skipping rollback");
                return Ok(Execution::Completed(StepOutcome::skipped(
                    "no setup record found, nothing to roll back",
                )));
            }
            (_, Direction::Forward, None) => {
                return Err(CoreError::validation(
                    "service_id",
                    format!("no setup record found for service '{}'", run.service_id.trim()),
                ));
            }
            (StepKind::Setup(_), Direction::Rollback, Some(record)) => {
                setup::prepare_rollback(&record, resolve_timeout(&record))
            }
            (StepKind::Deploy(params), direction, Some(record)) => {
                deploy::prepare(params, direction, &record, resolve_timeout(&record))
            }
            (StepKind::ListenerSwitch(params), direction, Some(record)) => {
                listener::prepare(params, direction, &record, resolve_timeout(&record), services, run)
                    .await?
            }
        };

        self.dispatch(services, run, prepared).await
    }

    fn validate(&self) -> Result<()> {
        match &self.spec.kind {
            StepKind::Setup(params) => setup::validate(params),
            StepKind::Deploy(params) => deploy::validate(params),
            StepKind::ListenerSwitch(params) => listener::validate(params),
        }
    }

    async fn dispatch(
        self,
        services: &StepServices,
        run: &WorkflowRunContext,
        prepared: Prepared,
    ) -> Result<Execution> {
        let activity_id = uuid::Uuid::new_v4().to_string();
        let policy = DirectionPolicy {
            direction: self.spec.direction,
            blue_green: prepared.blue_green,
        };

        let mut data = StepExecutionData {
            activity_id: activity_id.clone(),
            workflow_execution_id: run.workflow_execution_id.clone(),
            step_name: self.spec.step_name.clone(),
            command: prepared.command,
            direction: policy.direction,
            blue_green: policy.blue_green,
            timeout_minutes: prepared.timeout_minutes,
            new_group_id: None,
            new_group_name: None,
            old_group_id: None,
            old_group_name: None,
            new_group_capacity: None,
            old_group_capacity: None,
            traffic_weight: prepared.traffic_weight,
            command_units: prepared.units,
            new_instance_ids: Vec::new(),
            status: StepStatus::Pending,
            error_message: None,
            failure_type: None,
        };
        data.set_groups(prepared.new_group.as_ref(), prepared.old_group.as_ref());

        services
            .persistence
            .touch_run(&run.workflow_execution_id)
            .await?;

        let now = Utc::now();
        services
            .persistence
            .insert_activity(&ActivityRecord {
                activity_id: activity_id.clone(),
                workflow_execution_id: run.workflow_execution_id.clone(),
                account_id: run.account_id.clone(),
                app_id: run.app_id.clone(),
                service_id: run.service_id.clone(),
                command_name: prepared.command.as_str().to_string(),
                command_units: serde_json::to_string(&data.command_units)?,
                status: "running".to_string(),
                created_at: now,
                updated_at: now,
            })
            .await?;

        services
            .persistence
            .insert_step_execution(&StepExecutionRecord {
                activity_id: activity_id.clone(),
                workflow_execution_id: run.workflow_execution_id.clone(),
                step_name: data.step_name.clone(),
                command: prepared.command.as_str().to_string(),
                direction: policy.direction.as_str().to_string(),
                status: StepStatus::Pending.as_str().to_string(),
                data: serde_json::to_string(&data)?,
                error_message: None,
                failure_type: None,
                created_at: now,
                finished_at: None,
            })
            .await?;

        let order = WorkOrder {
            account_id: run.account_id.clone(),
            app_id: run.app_id.clone(),
            activity_id: activity_id.clone(),
            region: prepared.region,
            command_name: prepared.command,
            workflow_execution_id: run.workflow_execution_id.clone(),
            rollback: policy.is_rollback(),
            blue_green: policy.blue_green,
            timeout_minutes: prepared.timeout_minutes,
            old_group_config: prepared.old_group,
            new_group_config: prepared.new_group,
            operation: prepared.operation,
        };

        let awaiting = AwaitingStep {
            run: run.clone(),
            kind: self.spec.kind,
            policy,
            data,
        };

        match services.dispatcher.submit(order, &awaiting).await {
            Ok(correlation_id) => {
                info!(
                    activity_id = %activity_id,
                    command = prepared.command.as_str(),
                    "Step suspended awaiting worker response"
                );
                Ok(Execution::Suspended { correlation_id })
            }
            Err(e) => {
                let mut data = awaiting.data;
                data.status = StepStatus::Failed;
                data.failure_type = Some(FailureType::GenericFailure);
                data.error_message = Some(e.to_string());
                finalize(services, &data).await?;
                Err(e)
            }
        }
    }
}

/// A dispatched step. Only obtainable by claiming its correlation id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AwaitingStep {
    run: WorkflowRunContext,
    kind: StepKind,
    policy: DirectionPolicy,
    data: StepExecutionData,
}

impl AwaitingStep {
    /// Run the step belongs to.
    pub fn run(&self) -> &WorkflowRunContext {
        &self.run
    }

    /// Execution data as of dispatch.
    pub fn data(&self) -> &StepExecutionData {
        &self.data
    }

    /// Resume with the worker's response. Consumes the step.
    pub async fn on_response(
        self,
        services: &StepServices,
        response: TaskResponse,
    ) -> std::result::Result<StepOutcome, StepError> {
        let span = info_span!(
            "step_resume",
            workflow_execution_id = %self.run.workflow_execution_id,
            service_id = %self.run.service_id,
            activity_id = %self.data.activity_id,
            direction = self.policy.direction.as_str(),
        );
        self.on_response_inner(services, response)
            .instrument(span)
            .await
            .map_err(StepError::from)
    }

    async fn on_response_inner(
        self,
        services: &StepServices,
        response: TaskResponse,
    ) -> Result<StepOutcome> {
        let AwaitingStep {
            run,
            kind,
            policy,
            mut data,
        } = self;

        match classify(&response) {
            ResponseOutcome::Success => {
                let applied = match &kind {
                    StepKind::Setup(params) => {
                        setup::on_success(params, policy, &mut data, services, &run, &response.result)
                            .await
                    }
                    StepKind::Deploy(_) => {
                        deploy::on_success(policy, &mut data, services, &run, &response.result).await
                    }
                    StepKind::ListenerSwitch(params) => {
                        listener::on_success(
                            params,
                            policy,
                            &mut data,
                            services,
                            &run,
                            &response.result,
                        )
                        .await
                    }
                };
                if let Err(e) = applied {
                    data.status = StepStatus::Failed;
                    data.failure_type = Some(FailureType::GenericFailure);
                    data.error_message = Some(e.to_string());
                    finalize(services, &data).await?;
                    return Err(e);
                }
                data.status = StepStatus::Success;
            }
            ResponseOutcome::Failed(failure_type) => {
                data.status = StepStatus::Failed;
                data.failure_type = Some(failure_type);
                data.error_message = Some(
                    response
                        .error_message
                        .unwrap_or_else(|| format!("{} failed", data.command.as_str())),
                );
                if failure_type == FailureType::Timeout {
                    warn!("Worker reported a timeout, context propagation skipped");
                }
            }
        }

        finalize(services, &data).await?;
        info!(status = data.status.as_str(), "Step finished");
        Ok(StepOutcome::from_data(data))
    }

    /// Mark the step skipped without a response.
    pub(crate) async fn abandon(
        self,
        services: &StepServices,
        reason: &str,
    ) -> Result<StepOutcome> {
        let mut data = self.data;
        data.status = StepStatus::Skipped;
        data.error_message = Some(reason.to_string());
        finalize(services, &data).await?;
        info!(activity_id = %data.activity_id, reason = %reason, "Step abandoned");
        Ok(StepOutcome::from_data(data))
    }
}

/// Write the terminal status once; the activity follows the step and the
/// awaiting registration goes with it.
async fn finalize(services: &StepServices, data: &StepExecutionData) -> Result<()> {
    let payload = serde_json::to_string(data)?;
    let applied = services
        .persistence
        .finalize_step_execution_if_pending(
            &data.activity_id,
            data.status.as_str(),
            &payload,
            data.error_message.as_deref(),
            data.failure_type.map(|f| f.as_str()),
        )
        .await?;
    if !applied {
        return Err(CoreError::StepAlreadyTerminal {
            activity_id: data.activity_id.clone(),
        });
    }
    Ok(())
}

/// Percentage requests above 100 are clamped, count requests are not.
pub(crate) fn describe_request(request: &InstanceRequest) -> String {
    match request.unit {
        InstanceUnit::Percentage => format!("{}%", request.amount.min(100)),
        InstanceUnit::Count => format!("{} instances", request.amount),
    }
}
