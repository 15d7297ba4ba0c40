// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Setup step: create the new group and freeze the setup record.

use shiftwise_protocol::{Capacity, OperationParams, ScalingGroupConfig, TaskCommand, TaskResult};
use tracing::info;

use super::{
    DirectionPolicy, InitialCapacity, Prepared, SetupParams, StepExecutionData, StepServices,
};
use crate::error::{CoreError, Result};
use crate::handoff::{SETUP_CONTEXT_PREFIX, SetupContextRecord, handoff_key};
use crate::run::WorkflowRunContext;
use crate::tracker::{OperationKind, command_units};

pub(super) fn validate(params: &SetupParams) -> Result<()> {
    if params.name_prefix.trim().is_empty() {
        return Err(CoreError::validation("name_prefix", "must not be empty"));
    }
    if params.region.trim().is_empty() {
        return Err(CoreError::validation("region", "must not be empty"));
    }
    if params.blue_green && params.load_balancers.is_empty() {
        return Err(CoreError::validation(
            "load_balancers",
            "blue/green setup requires at least one load balancer",
        ));
    }
    if let InitialCapacity::Fixed { capacity } = params.initial_capacity
        && !capacity.is_ordered()
    {
        return Err(CoreError::validation(
            "initial_capacity",
            format!(
                "expected minimum <= target <= maximum, got {}/{}/{}",
                capacity.minimum, capacity.target, capacity.maximum
            ),
        ));
    }
    Ok(())
}

pub(super) fn prepare_forward(params: &SetupParams, timeout_minutes: u32) -> Prepared {
    Prepared {
        blue_green: params.blue_green,
        command: TaskCommand::Setup,
        region: params.region.clone(),
        timeout_minutes,
        new_group: None,
        old_group: None,
        operation: OperationParams::Setup {
            name_prefix: params.name_prefix.clone(),
            load_balancers: params.load_balancers.clone(),
            use_current_running_count: matches!(
                params.initial_capacity,
                InitialCapacity::UseCurrentRunning { .. }
            ),
        },
        units: command_units(
            OperationKind::Setup,
            params.blue_green,
            false,
            params.resize_strategy,
        ),
        traffic_weight: None,
    }
}

/// Tear down the group the setup step created.
pub(super) fn prepare_rollback(record: &SetupContextRecord, timeout_minutes: u32) -> Prepared {
    Prepared {
        blue_green: record.blue_green,
        command: TaskCommand::DeleteGroup,
        region: record.region.clone(),
        timeout_minutes,
        new_group: Some(record.new_group.clone()),
        old_group: record.old_group.clone(),
        operation: OperationParams::DeleteGroup,
        units: command_units(
            OperationKind::Setup,
            record.blue_green,
            true,
            record.resize_strategy,
        ),
        traffic_weight: None,
    }
}

pub(super) async fn on_success(
    params: &SetupParams,
    policy: DirectionPolicy,
    data: &mut StepExecutionData,
    services: &StepServices,
    run: &WorkflowRunContext,
    result: &TaskResult,
) -> Result<()> {
    if policy.is_rollback() {
        info!(
            new_group_id = data.new_group_id.as_deref().unwrap_or("-"),
            "New group deleted"
        );
        return Ok(());
    }

    let TaskResult::Setup {
        new_group,
        old_group,
    } = result
    else {
        return Err(CoreError::validation(
            "result",
            "setup response did not carry group details",
        ));
    };

    let record = SetupContextRecord {
        new_group: new_group.with_capacity(full_capacity(params, old_group.as_ref())),
        old_group: old_group.clone(),
        resize_strategy: params.resize_strategy,
        blue_green: params.blue_green,
        load_balancers: params.load_balancers.clone(),
        name_prefix: params.name_prefix.clone(),
        region: params.region.clone(),
        timeout_minutes: data.timeout_minutes,
    };

    services
        .handoff
        .put_once(run, &handoff_key(SETUP_CONTEXT_PREFIX, &run.service_id), &record)
        .await?;

    data.set_groups(Some(&record.new_group), record.old_group.as_ref());
    info!(
        new_group_id = %record.new_group.id,
        old_group_id = record.old_group.as_ref().map(|g| g.id.as_str()).unwrap_or("-"),
        target = record.new_group.capacity.target,
        "Setup record written"
    );
    Ok(())
}

/// Full-scale capacity the new group is deployed towards.
fn full_capacity(
    params: &SetupParams,
    old_group: Option<&ScalingGroupConfig>,
) -> Capacity {
    match params.initial_capacity {
        InitialCapacity::Fixed { capacity } => capacity,
        InitialCapacity::UseCurrentRunning { fallback } => old_group
            .map(|g| g.capacity)
            .filter(|c| c.target > 0)
            .unwrap_or(fallback),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shiftwise_protocol::{LoadBalancerWiring, ResizeStrategy};

    fn params(initial_capacity: InitialCapacity) -> SetupParams {
        SetupParams {
            name_prefix: "web".to_string(),
            region: "eu-west-1".to_string(),
            blue_green: false,
            resize_strategy: ResizeStrategy::DownsizeOldFirst,
            initial_capacity,
            load_balancers: vec![],
        }
    }

    #[test]
    fn test_validate_rejects_bad_input() {
        let mut p = params(InitialCapacity::Fixed {
            capacity: Capacity::new(1, 4, 2),
        });
        assert!(validate(&p).is_ok());

        p.region = "  ".to_string();
        assert!(validate(&p).is_err());

        let mut p = params(InitialCapacity::Fixed {
            capacity: Capacity::new(3, 4, 2),
        });
        assert!(validate(&p).is_err());

        p.initial_capacity = InitialCapacity::Fixed {
            capacity: Capacity::new(1, 4, 2),
        };
        p.blue_green = true;
        assert!(validate(&p).is_err());
        p.load_balancers.push(LoadBalancerWiring {
            load_balancer: "lb".to_string(),
            prod_listener_port: 80,
            stage_listener_port: Some(8080),
            prod_target_group: "tg-prod".to_string(),
            stage_target_group: Some("tg-stage".to_string()),
        });
        assert!(validate(&p).is_ok());
    }

    #[test]
    fn test_full_capacity_uses_running_group() {
        let old = ScalingGroupConfig::new("sg-old", "web__1", Capacity::new(2, 8, 5));
        let p = params(InitialCapacity::UseCurrentRunning {
            fallback: Capacity::pinned(1),
        });
        assert_eq!(full_capacity(&p, Some(&old)), Capacity::new(2, 8, 5));
        assert_eq!(full_capacity(&p, None), Capacity::pinned(1));

        let drained = old.with_capacity(Capacity::zero());
        assert_eq!(full_capacity(&p, Some(&drained)), Capacity::pinned(1));
    }

    #[test]
    fn test_full_capacity_fixed_ignores_old_group() {
        let old = ScalingGroupConfig::new("sg-old", "web__1", Capacity::new(2, 8, 5));
        let p = params(InitialCapacity::Fixed {
            capacity: Capacity::new(1, 10, 10),
        });
        assert_eq!(full_capacity(&p, Some(&old)), Capacity::new(1, 10, 10));
    }

    #[test]
    fn test_prepare_forward_requests_current_count() {
        let p = params(InitialCapacity::UseCurrentRunning {
            fallback: Capacity::pinned(1),
        });
        let prepared = prepare_forward(&p, 15);
        assert_eq!(prepared.command, TaskCommand::Setup);
        assert_eq!(prepared.timeout_minutes, 15);
        assert!(matches!(
            prepared.operation,
            OperationParams::Setup {
                use_current_running_count: true,
                ..
            }
        ));
    }
}
