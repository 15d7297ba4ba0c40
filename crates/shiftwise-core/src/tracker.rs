// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Human-visible sub-phases of a step.
//!
//! The list is computed once, attached to the activity before dispatch, and
//! never recomputed. Every list ends with [`CommandUnit::DeploymentError`] so
//! a failure always has somewhere to be reported.

use serde::{Deserialize, Serialize};
use shiftwise_protocol::ResizeStrategy;
use std::fmt;

/// A named sub-phase shown in the activity log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandUnit {
    /// New group scale-up requested.
    UpScale,
    /// Waiting for the new group to reach steady state.
    UpScaleSteadyStateWait,
    /// Old group scale-down requested.
    DownScale,
    /// Waiting for the old group to reach steady state.
    DownScaleSteadyStateWait,
    /// Listener routes swapped between target groups.
    SwapRoutes,
    /// Old group renamed.
    RenameOld,
    /// New group renamed.
    RenameNew,
    /// Group created by setup deleted.
    DeleteNewGroup,
    /// Failure sink.
    DeploymentError,
    /// New group created.
    Setup,
}

impl CommandUnit {
    /// Display name of the unit.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::UpScale => "UpScale",
            Self::UpScaleSteadyStateWait => "UpScaleSteadyStateWait",
            Self::DownScale => "DownScale",
            Self::DownScaleSteadyStateWait => "DownScaleSteadyStateWait",
            Self::SwapRoutes => "SwapRoutes",
            Self::RenameOld => "RenameOld",
            Self::RenameNew => "RenameNew",
            Self::DeleteNewGroup => "DeleteNewGroup",
            Self::DeploymentError => "DeploymentError",
            Self::Setup => "Setup",
        }
    }
}

impl fmt::Display for CommandUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Step family the unit list is computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    /// Setup step.
    Setup,
    /// Deploy/resize phase.
    Deploy,
    /// Listener/traffic switch.
    ListenerSwitch {
        /// Whether the old group is drained after the swap.
        downsize_old: bool,
    },
}

const UP: [CommandUnit; 2] = [CommandUnit::UpScale, CommandUnit::UpScaleSteadyStateWait];
const DOWN: [CommandUnit; 2] = [
    CommandUnit::DownScale,
    CommandUnit::DownScaleSteadyStateWait,
];
const SWAP: [CommandUnit; 3] = [
    CommandUnit::SwapRoutes,
    CommandUnit::RenameOld,
    CommandUnit::RenameNew,
];

/// Ordered command units for a step.
///
/// Blue/green is always treated as resize-new-first.
pub fn command_units(
    kind: OperationKind,
    blue_green: bool,
    rollback: bool,
    strategy: ResizeStrategy,
) -> Vec<CommandUnit> {
    let mut units = Vec::with_capacity(8);
    match kind {
        OperationKind::Setup if rollback => units.push(CommandUnit::DeleteNewGroup),
        OperationKind::Setup => units.push(CommandUnit::Setup),
        OperationKind::Deploy if blue_green && !rollback => units.extend(UP),
        OperationKind::Deploy => {
            if rollback || strategy == ResizeStrategy::ResizeNewFirst {
                units.extend(UP);
                units.extend(DOWN);
            } else {
                units.extend(DOWN);
                units.extend(UP);
            }
        }
        OperationKind::ListenerSwitch { .. } if rollback => {
            units.extend(UP);
            units.extend(SWAP);
            units.extend(DOWN);
        }
        OperationKind::ListenerSwitch { downsize_old } => {
            units.extend(SWAP);
            if downsize_old {
                units.extend(DOWN);
            }
        }
    }
    units.push(CommandUnit::DeploymentError);
    units
}
