// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Messages exchanged between the orchestrator and remote worker agents.
//!
//! A [`WorkOrder`] travels orchestrator → worker. A [`TaskResponse`] travels
//! worker → orchestrator and is matched to the awaiting step by its
//! `correlation_id`.

use serde::{Deserialize, Serialize};

/// Min/max/target instance counts of a scaling group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capacity {
    /// Lower autoscaling bound.
    pub minimum: u32,
    /// Upper autoscaling bound.
    pub maximum: u32,
    /// Desired number of running instances.
    pub target: u32,
}

impl Capacity {
    /// Create a capacity triple.
    pub fn new(minimum: u32, maximum: u32, target: u32) -> Self {
        Self {
            minimum,
            maximum,
            target,
        }
    }

    /// A fully drained group.
    pub fn zero() -> Self {
        Self::default()
    }

    /// All three values pinned to `count`.
    pub fn pinned(count: u32) -> Self {
        Self::new(count, count, count)
    }

    /// `minimum <= target <= maximum`.
    pub fn is_ordered(&self) -> bool {
        self.minimum <= self.target && self.target <= self.maximum
    }
}

/// A cloud scaling group as seen by the orchestrator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScalingGroupConfig {
    /// Provider-assigned identifier.
    pub id: String,
    /// Human-readable group name.
    pub name: String,
    /// Capacity triple.
    pub capacity: Capacity,
}

impl ScalingGroupConfig {
    /// Create a group config.
    pub fn new(id: impl Into<String>, name: impl Into<String>, capacity: Capacity) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capacity,
        }
    }

    /// Copy of this group with a different capacity.
    pub fn with_capacity(&self, capacity: Capacity) -> Self {
        Self {
            capacity,
            ..self.clone()
        }
    }
}

/// Unit in which instance counts are requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InstanceUnit {
    /// Percentage of the full-scale target.
    Percentage,
    /// Absolute instance count.
    Count,
}

/// Which group is resized first during a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResizeStrategy {
    /// Bring the new group up before shrinking the old one.
    ResizeNewFirst,
    /// Shrink the old group before bringing the new one up.
    #[default]
    DownsizeOldFirst,
}

/// Remote command a work order asks the worker to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskCommand {
    /// Create the new group and report the live one.
    Setup,
    /// Resize new and old groups.
    Resize,
    /// Swap or shift listener traffic between groups.
    SwitchTraffic,
    /// Tear down the group created by setup.
    DeleteGroup,
}

impl TaskCommand {
    /// Stable name used in logs and activity records.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Setup => "SETUP",
            Self::Resize => "RESIZE",
            Self::SwitchTraffic => "SWITCH_TRAFFIC",
            Self::DeleteGroup => "DELETE_GROUP",
        }
    }
}

/// Load balancer listener wiring used for blue/green traffic switching.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerWiring {
    /// Load balancer name.
    pub load_balancer: String,
    /// Production listener port.
    pub prod_listener_port: u16,
    /// Stage listener port, blue/green only.
    pub stage_listener_port: Option<u16>,
    /// Target group currently serving production.
    pub prod_target_group: String,
    /// Target group receiving the new group during blue/green.
    pub stage_target_group: Option<String>,
}

/// Operation-specific parameters of a work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OperationParams {
    /// Parameters for [`TaskCommand::Setup`].
    Setup {
        /// Prefix used to name the new group.
        name_prefix: String,
        /// Listener wiring, empty for non blue/green setups.
        load_balancers: Vec<LoadBalancerWiring>,
        /// Size the new group from the currently running old group.
        use_current_running_count: bool,
    },
    /// Parameters for [`TaskCommand::Resize`].
    Resize {
        /// Whether the worker should bring the new group up first.
        resize_new_first: bool,
    },
    /// Parameters for [`TaskCommand::SwitchTraffic`].
    SwitchTraffic {
        /// Listener wiring from setup.
        load_balancers: Vec<LoadBalancerWiring>,
        /// Drain the old group after the swap.
        downsize_old: bool,
        /// Weighted shift (0-100) instead of a full swap.
        traffic_weight: Option<u8>,
    },
    /// Parameters for [`TaskCommand::DeleteGroup`].
    DeleteGroup,
}

/// Unit of work dispatched to a remote worker.
///
/// Outbound only: the orchestrator never mutates an order after submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkOrder {
    /// Account owning the run.
    pub account_id: String,
    /// Application owning the run.
    pub app_id: String,
    /// Activity id, also the correlation id of the response.
    pub activity_id: String,
    /// Cloud region.
    pub region: String,
    /// Command to run.
    pub command_name: TaskCommand,
    /// Workflow run this order belongs to.
    pub workflow_execution_id: String,
    /// Order issued by a rollback step.
    pub rollback: bool,
    /// Run is a blue/green deployment.
    pub blue_green: bool,
    /// Remote timeout; exceeding it yields a `TIMEOUT` response.
    pub timeout_minutes: u32,
    /// Currently live group, if any.
    pub old_group_config: Option<ScalingGroupConfig>,
    /// Group being deployed.
    pub new_group_config: Option<ScalingGroupConfig>,
    /// Command-specific parameters.
    pub operation: OperationParams,
}

/// Outcome reported by the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionStatus {
    /// The command finished successfully.
    Success,
    /// The command failed.
    Failure,
}

/// Failure classification surfaced to the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FailureType {
    /// The remote side gave up waiting. Side effects may have happened.
    Timeout,
    /// Any other failure.
    GenericFailure,
}

impl FailureType {
    /// Wire name of the classification.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::GenericFailure => "GENERIC_FAILURE",
        }
    }
}

/// Compute instance reported by a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Provider instance id.
    pub instance_id: String,
    /// Private address, when known.
    pub private_ip: Option<String>,
    /// Group the instance belongs to.
    pub group_id: String,
}

/// Command-specific payload of a response.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TaskResult {
    /// Result of [`TaskCommand::Setup`].
    Setup {
        /// Newly created group at zero capacity.
        new_group: ScalingGroupConfig,
        /// Currently live group, if any.
        old_group: Option<ScalingGroupConfig>,
    },
    /// Result of [`TaskCommand::Resize`].
    Resize {
        /// Instances launched by this resize.
        new_instances: Vec<InstanceInfo>,
        /// Instances that were already running.
        existing_instances: Vec<InstanceInfo>,
    },
    /// Result of [`TaskCommand::SwitchTraffic`].
    SwitchTraffic {
        /// Weight applied to the new group, if weighted.
        applied_weight: Option<u8>,
    },
    /// No payload.
    #[default]
    Empty,
}

/// Response to a work order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResponse {
    /// Correlation id, equal to the order's `activity_id`.
    pub correlation_id: String,
    /// Success or failure.
    pub status: ExecutionStatus,
    /// Set on failure; `None` on failure means generic.
    #[serde(default)]
    pub failure_type: Option<FailureType>,
    /// Human-readable error.
    #[serde(default)]
    pub error_message: Option<String>,
    /// Command payload.
    #[serde(default)]
    pub result: TaskResult,
}

impl TaskResponse {
    /// Successful response carrying `result`.
    pub fn success(correlation_id: impl Into<String>, result: TaskResult) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ExecutionStatus::Success,
            failure_type: None,
            error_message: None,
            result,
        }
    }

    /// Failed response.
    pub fn failure(
        correlation_id: impl Into<String>,
        failure_type: FailureType,
        error_message: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            status: ExecutionStatus::Failure,
            failure_type: Some(failure_type),
            error_message: Some(error_message.into()),
            result: TaskResult::Empty,
        }
    }

    /// Whether the worker reported a timeout.
    pub fn is_timeout(&self) -> bool {
        self.failure_type == Some(FailureType::Timeout)
    }
}

/// Worker registration sent once after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerHello {
    /// Stable worker identifier.
    pub worker_id: String,
    /// Worker software version.
    pub version: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_ordering() {
        assert!(Capacity::new(1, 5, 3).is_ordered());
        assert!(Capacity::zero().is_ordered());
        assert!(!Capacity::new(4, 5, 3).is_ordered());
        assert!(!Capacity::new(1, 2, 3).is_ordered());
        assert_eq!(Capacity::pinned(7), Capacity::new(7, 7, 7));
    }

    #[test]
    fn test_with_capacity_leaves_original_untouched() {
        let original = ScalingGroupConfig::new("sg-1", "web__1", Capacity::new(1, 10, 5));
        let resized = original.with_capacity(Capacity::zero());
        assert_eq!(original.capacity, Capacity::new(1, 10, 5));
        assert_eq!(resized.capacity, Capacity::zero());
        assert_eq!(resized.id, "sg-1");
    }

    #[test]
    fn test_enum_wire_names() {
        assert_eq!(
            serde_json::to_string(&FailureType::GenericFailure).unwrap(),
            "\"GENERIC_FAILURE\""
        );
        assert_eq!(
            serde_json::to_string(&ResizeStrategy::ResizeNewFirst).unwrap(),
            "\"RESIZE_NEW_FIRST\""
        );
        assert_eq!(
            serde_json::to_string(&InstanceUnit::Percentage).unwrap(),
            "\"PERCENTAGE\""
        );
        assert_eq!(FailureType::Timeout.as_str(), "TIMEOUT");
    }

    #[test]
    fn test_response_defaults_when_fields_missing() {
        let json = r#"{"correlation_id":"act-1","status":"FAILURE"}"#;
        let response: TaskResponse = serde_json::from_str(json).unwrap();
        assert_eq!(response.status, ExecutionStatus::Failure);
        assert!(response.failure_type.is_none());
        assert!(!response.is_timeout());
        assert_eq!(response.result, TaskResult::Empty);
    }

    #[test]
    fn test_timeout_response() {
        let response = TaskResponse::failure("act-2", FailureType::Timeout, "timed out");
        assert!(response.is_timeout());
        assert_eq!(response.error_message.as_deref(), Some("timed out"));
    }
}
