// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Identity of one in-flight deployment run.

use serde::{Deserialize, Serialize};

/// Identifies a workflow run. Immutable for the run's lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRunContext {
    /// Workflow execution id; scopes every handoff record.
    pub workflow_execution_id: String,
    /// Application id.
    pub app_id: String,
    /// Environment id.
    pub env_id: String,
    /// Service being deployed.
    pub service_id: String,
    /// Owning account.
    pub account_id: String,
}

impl WorkflowRunContext {
    /// Create a run context.
    pub fn new(
        workflow_execution_id: impl Into<String>,
        app_id: impl Into<String>,
        env_id: impl Into<String>,
        service_id: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            workflow_execution_id: workflow_execution_id.into(),
            app_id: app_id.into(),
            env_id: env_id.into(),
            service_id: service_id.into(),
            account_id: account_id.into(),
        }
    }
}
