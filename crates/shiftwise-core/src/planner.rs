// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scaling capacity planner.
//!
//! Pure functions: given unit semantics and the frozen setup-time groups,
//! compute the capacity each group should have after a phase.
//!
//! During a non-final phase both groups are pinned (`min = max = target`) so
//! the provider's autoscaler cannot move them mid-transition. The final phase
//! restores the new group's full-scale bounds and drains a non blue/green old
//! group to zero.

use serde::{Deserialize, Serialize};
use shiftwise_protocol::{Capacity, InstanceUnit, ScalingGroupConfig};

/// An amount expressed in a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceRequest {
    /// Requested amount.
    pub amount: u32,
    /// Unit of `amount`.
    pub unit: InstanceUnit,
}

impl InstanceRequest {
    /// Percentage request.
    pub fn percentage(amount: u32) -> Self {
        Self {
            amount,
            unit: InstanceUnit::Percentage,
        }
    }

    /// Absolute count request.
    pub fn count(amount: u32) -> Self {
        Self {
            amount,
            unit: InstanceUnit::Count,
        }
    }
}

/// Number of new-group instances to run for a phase.
///
/// A percentage request never yields zero instances.
pub fn instance_count_to_update(max_count: u32, requested: u32, unit: InstanceUnit) -> u32 {
    match unit {
        InstanceUnit::Percentage => {
            let percent = u64::from(requested.min(100));
            // round half up
            let count = (percent * u64::from(max_count) * 2 + 100) / 200;
            (count as u32).max(1)
        }
        InstanceUnit::Count => requested.min(max_count),
    }
}

/// Target the old group should be driven to during a deploy phase.
///
/// `None` means there is no old group, so nothing to downsize.
pub fn downsize_count(
    upsize_count: u32,
    old_group: Option<&ScalingGroupConfig>,
    blue_green: bool,
    downsize_override: Option<InstanceRequest>,
) -> Option<u32> {
    let old_group = old_group?;
    let old_target = old_group.capacity.target;

    if blue_green {
        return Some(old_target);
    }

    let count = match downsize_override {
        None => old_target.saturating_sub(upsize_count),
        Some(InstanceRequest {
            amount,
            unit: InstanceUnit::Count,
        }) => amount,
        Some(InstanceRequest {
            amount,
            unit: InstanceUnit::Percentage,
        }) => {
            let percent = u64::from(amount.min(100));
            (percent * u64::from(old_target) / 100) as u32
        }
    };
    Some(count)
}

/// Whether a request brings the new group to full scale.
pub fn is_final_phase(unit: InstanceUnit, requested: u32, full_target: u32) -> bool {
    match unit {
        InstanceUnit::Percentage => requested == 100,
        InstanceUnit::Count => requested >= full_target,
    }
}

/// Capacities computed for one phase.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhasePlan {
    /// New group with the capacity it should reach.
    pub new_group: ScalingGroupConfig,
    /// Old group with the capacity it should reach, if there is one.
    pub old_group: Option<ScalingGroupConfig>,
    /// New-group target.
    pub upsize_count: u32,
    /// Old-group target, `None` when there is no old group.
    pub downsize_count: Option<u32>,
    /// Whether this phase completes the rollout.
    pub final_phase: bool,
}

/// Plan a forward deploy phase.
///
/// `new_full` and `old_original` come from the frozen setup record; the
/// returned configs are private copies.
pub fn plan_phase(
    new_full: &ScalingGroupConfig,
    old_original: Option<&ScalingGroupConfig>,
    upsize: InstanceRequest,
    downsize_override: Option<InstanceRequest>,
    blue_green: bool,
) -> PhasePlan {
    let full = new_full.capacity;
    let upsize_count = instance_count_to_update(full.target, upsize.amount, upsize.unit);
    let final_phase = is_final_phase(upsize.unit, upsize.amount, full.target);

    let new_capacity = if final_phase {
        Capacity::new(
            full.minimum.min(upsize_count),
            full.maximum.max(upsize_count),
            upsize_count,
        )
    } else {
        Capacity::pinned(upsize_count)
    };

    let downsize = downsize_count(upsize_count, old_original, blue_green, downsize_override);
    let old_group = old_original.map(|old| {
        if blue_green {
            old.clone()
        } else if final_phase {
            old.with_capacity(Capacity::zero())
        } else {
            old.with_capacity(Capacity::pinned(downsize.unwrap_or(0)))
        }
    });

    PhasePlan {
        new_group: new_full.with_capacity(new_capacity),
        downsize_count: old_group.as_ref().map(|g| g.capacity.target),
        old_group,
        upsize_count,
        final_phase,
    }
}

/// Plan a rollback: old group back to its setup-time capacity, new group to zero.
pub fn plan_rollback(
    new_full: &ScalingGroupConfig,
    old_original: Option<&ScalingGroupConfig>,
) -> PhasePlan {
    let old_group = old_original.cloned();
    PhasePlan {
        new_group: new_full.with_capacity(Capacity::zero()),
        upsize_count: 0,
        downsize_count: old_group.as_ref().map(|g| g.capacity.target),
        old_group,
        final_phase: true,
    }
}
