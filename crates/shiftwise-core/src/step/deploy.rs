// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Deploy phase: resize the new and old groups.
//!
//! Forward phases plan from the frozen setup record. A rollback restores the
//! old group to its setup-time capacity and drains the new one, then leaves
//! a marker so later rollback phases of the same run do nothing.

use shiftwise_protocol::{InstanceUnit, OperationParams, ResizeStrategy, TaskCommand, TaskResult};
use tracing::info;

use super::{
    DeployParams, Direction, DirectionPolicy, Prepared, StepExecutionData, StepServices,
    describe_request,
};
use crate::error::{CoreError, Result};
use crate::handoff::{
    HandoffStore, INSTANCE_LIST_PREFIX, InstanceListRecord, ROLLBACK_DONE_PREFIX,
    RollbackMarker, SetupContextRecord, handoff_key,
};
use crate::planner::{plan_phase, plan_rollback};
use crate::run::WorkflowRunContext;
use crate::tracker::{OperationKind, command_units};

pub(super) fn validate(params: &DeployParams) -> Result<()> {
    if params.upsize.unit == InstanceUnit::Percentage && params.upsize.amount > 100 {
        return Err(CoreError::validation(
            "upsize",
            format!("percentage must be at most 100, got {}", params.upsize.amount),
        ));
    }
    if let Some(downsize) = params.downsize_override
        && downsize.unit == InstanceUnit::Percentage
        && downsize.amount > 100
    {
        return Err(CoreError::validation(
            "downsize_override",
            format!("percentage must be at most 100, got {}", downsize.amount),
        ));
    }
    Ok(())
}

/// Whether a previous rollback phase of this run already restored the old group.
pub(super) async fn rollback_already_done(
    handoff: &HandoffStore,
    run: &WorkflowRunContext,
) -> Result<bool> {
    let marker: Option<RollbackMarker> = handoff
        .get(run, &handoff_key(ROLLBACK_DONE_PREFIX, &run.service_id))
        .await?;
    Ok(marker.is_some())
}

pub(super) fn prepare(
    params: &DeployParams,
    direction: Direction,
    record: &SetupContextRecord,
    timeout_minutes: u32,
) -> Prepared {
    let rollback = direction == Direction::Rollback;
    let strategy = record.effective_strategy();

    let plan = if rollback {
        plan_rollback(&record.new_group, record.old_group.as_ref())
    } else {
        plan_phase(
            &record.new_group,
            record.old_group.as_ref(),
            params.upsize,
            params.downsize_override,
            record.blue_green,
        )
    };

    info!(
        request = %describe_request(&params.upsize),
        upsize = plan.upsize_count,
        downsize = ?plan.downsize_count,
        final_phase = plan.final_phase,
        rollback,
        "Planned resize"
    );

    Prepared {
        blue_green: record.blue_green,
        command: TaskCommand::Resize,
        region: record.region.clone(),
        timeout_minutes,
        new_group: Some(plan.new_group),
        old_group: plan.old_group,
        operation: OperationParams::Resize {
            resize_new_first: rollback || strategy == ResizeStrategy::ResizeNewFirst,
        },
        units: command_units(OperationKind::Deploy, record.blue_green, rollback, strategy),
        traffic_weight: None,
    }
}

pub(super) async fn on_success(
    policy: DirectionPolicy,
    data: &mut StepExecutionData,
    services: &StepServices,
    run: &WorkflowRunContext,
    result: &TaskResult,
) -> Result<()> {
    if policy.is_rollback() {
        services
            .handoff
            .put(
                run,
                &handoff_key(ROLLBACK_DONE_PREFIX, &run.service_id),
                &RollbackMarker {
                    activity_id: data.activity_id.clone(),
                },
            )
            .await?;
        info!("All-phase rollback marker written");
        return Ok(());
    }

    let instances = match result {
        TaskResult::Resize {
            new_instances,
            existing_instances,
        } => InstanceListRecord::from_resize(new_instances.clone(), existing_instances.clone()),
        TaskResult::Empty => InstanceListRecord::default(),
        _ => {
            return Err(CoreError::validation(
                "result",
                "resize response carried an unexpected payload",
            ));
        }
    };

    data.new_instance_ids = instances
        .new_instances()
        .map(|i| i.instance_id.clone())
        .collect();

    services
        .handoff
        .put(
            run,
            &handoff_key(INSTANCE_LIST_PREFIX, &run.service_id),
            &instances,
        )
        .await?;
    info!(
        new_instances = data.new_instance_ids.len(),
        total = instances.instances.len(),
        "Instance list written"
    );
    Ok(())
}
