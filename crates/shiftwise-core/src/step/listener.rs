// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Listener switch: swap routes or shift weighted traffic to the new group.

use shiftwise_protocol::{Capacity, OperationParams, TaskCommand, TaskResult};
use tracing::info;

use super::{
    Direction, DirectionPolicy, ListenerParams, Prepared, StepExecutionData, StepServices,
};
use crate::error::{CoreError, Result};
use crate::handoff::{SetupContextRecord, TRAFFIC_WEIGHT_PREFIX, TrafficWeightRecord, handoff_key};
use crate::planner::plan_rollback;
use crate::run::WorkflowRunContext;
use crate::tracker::{OperationKind, command_units};

pub(super) fn validate(params: &ListenerParams) -> Result<()> {
    if let Some(weight) = params.traffic_weight
        && weight > 100
    {
        return Err(CoreError::validation(
            "traffic_weight",
            format!("must be at most 100, got {}", weight),
        ));
    }
    Ok(())
}

async fn current_weight(
    services: &StepServices,
    run: &WorkflowRunContext,
) -> Result<Option<TrafficWeightRecord>> {
    services
        .handoff
        .get(run, &handoff_key(TRAFFIC_WEIGHT_PREFIX, &run.service_id))
        .await
}

pub(super) async fn prepare(
    params: &ListenerParams,
    direction: Direction,
    record: &SetupContextRecord,
    timeout_minutes: u32,
    services: &StepServices,
    run: &WorkflowRunContext,
) -> Result<Prepared> {
    let rollback = direction == Direction::Rollback;

    if !rollback && record.load_balancers.is_empty() {
        return Err(CoreError::validation(
            "load_balancers",
            "setup record has no load balancer wiring to switch",
        ));
    }

    let (new_group, old_group, downsize_old, traffic_weight) = if rollback {
        let plan = plan_rollback(&record.new_group, record.old_group.as_ref());
        let weight = current_weight(services, run).await?.map(|_| 0);
        (plan.new_group, plan.old_group, true, weight)
    } else {
        let old_group = record.old_group.as_ref().map(|old| {
            if params.downsize_old {
                old.with_capacity(Capacity::zero())
            } else {
                old.clone()
            }
        });
        (
            record.new_group.clone(),
            old_group,
            params.downsize_old,
            params.traffic_weight,
        )
    };

    info!(
        rollback,
        downsize_old,
        traffic_weight = ?traffic_weight,
        load_balancers = record.load_balancers.len(),
        "Planned listener switch"
    );

    Ok(Prepared {
        blue_green: record.blue_green,
        command: TaskCommand::SwitchTraffic,
        region: record.region.clone(),
        timeout_minutes,
        new_group: Some(new_group),
        old_group,
        operation: OperationParams::SwitchTraffic {
            load_balancers: record.load_balancers.clone(),
            downsize_old,
            traffic_weight,
        },
        units: command_units(
            OperationKind::ListenerSwitch { downsize_old },
            record.blue_green,
            rollback,
            record.effective_strategy(),
        ),
        traffic_weight,
    })
}

pub(super) async fn on_success(
    params: &ListenerParams,
    policy: DirectionPolicy,
    data: &mut StepExecutionData,
    services: &StepServices,
    run: &WorkflowRunContext,
    result: &TaskResult,
) -> Result<()> {
    let key = handoff_key(TRAFFIC_WEIGHT_PREFIX, &run.service_id);

    if policy.is_rollback() {
        if current_weight(services, run).await?.is_some() {
            services
                .handoff
                .put(run, &key, &TrafficWeightRecord { new_group_weight: 0 })
                .await?;
            data.traffic_weight = Some(0);
            info!("Traffic weight reset to the old group");
        }
        return Ok(());
    }

    let Some(requested) = params.traffic_weight else {
        info!("Routes swapped");
        return Ok(());
    };

    let applied = match result {
        TaskResult::SwitchTraffic {
            applied_weight: Some(weight),
        } => *weight,
        _ => requested,
    };
    if applied > 100 {
        return Err(CoreError::validation(
            "applied_weight",
            format!("worker reported weight {}", applied),
        ));
    }

    services
        .handoff
        .put(
            run,
            &key,
            &TrafficWeightRecord {
                new_group_weight: applied,
            },
        )
        .await?;
    data.traffic_weight = Some(applied);
    info!(weight = applied, "Traffic weight written");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_traffic_weight() {
        let ok = ListenerParams {
            downsize_old: false,
            traffic_weight: Some(100),
        };
        assert!(validate(&ok).is_ok());

        let too_high = ListenerParams {
            downsize_old: false,
            traffic_weight: Some(101),
        };
        let err = validate(&too_high).unwrap_err();
        assert_eq!(err.error_code(), "VALIDATION_ERROR");

        let swap = ListenerParams {
            downsize_old: true,
            traffic_weight: None,
        };
        assert!(validate(&swap).is_ok());
    }
}
