// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for shiftwise-core integration tests.
//!
//! Provides TestContext with an in-memory database, an in-process task queue
//! standing in for the workers, and an orchestrator wired to both.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use uuid::Uuid;

use shiftwise_core::dispatcher::ChannelTaskQueue;
use shiftwise_core::persistence::SqlitePersistence;
use shiftwise_core::planner::InstanceRequest;
use shiftwise_core::step::{
    DeployParams, Execution, InitialCapacity, ListenerParams, SetupParams, StepKind, StepOutcome,
    StepSpec,
};
use shiftwise_core::{CorrelationId, Orchestrator, WorkflowRunContext};
use shiftwise_protocol::{
    Capacity, InstanceInfo, LoadBalancerWiring, ResizeStrategy, ScalingGroupConfig, TaskResponse,
    TaskResult, WorkOrder,
};

/// Test context with an orchestrator and the receiving end of its queue.
pub struct TestContext {
    pub persistence: Arc<SqlitePersistence>,
    pub orchestrator: Orchestrator,
    pub orders: mpsc::UnboundedReceiver<WorkOrder>,
}

impl TestContext {
    pub async fn new() -> Self {
        let persistence = Arc::new(
            SqlitePersistence::in_memory()
                .await
                .expect("in-memory database"),
        );
        let (queue, orders) = ChannelTaskQueue::new();
        let orchestrator = Orchestrator::new(persistence.clone(), Arc::new(queue), 10);
        Self {
            persistence,
            orchestrator,
            orders,
        }
    }

    /// Execute a step that must suspend; returns the correlation id and the order.
    pub async fn dispatch(
        &mut self,
        run: &WorkflowRunContext,
        spec: StepSpec,
    ) -> (CorrelationId, WorkOrder) {
        let execution = self
            .orchestrator
            .execute(run, spec)
            .await
            .expect("step should dispatch");
        let Execution::Suspended { correlation_id } = execution else {
            panic!("expected a suspended step, got {:?}", execution);
        };
        let order = self.next_order().await;
        assert_eq!(order.activity_id, correlation_id.as_str());
        (correlation_id, order)
    }

    /// Execute a step that must finish without a remote call.
    pub async fn complete_locally(
        &mut self,
        run: &WorkflowRunContext,
        spec: StepSpec,
    ) -> StepOutcome {
        let execution = self
            .orchestrator
            .execute(run, spec)
            .await
            .expect("step should not fail");
        let Execution::Completed(outcome) = execution else {
            panic!("expected a completed step, got {:?}", execution);
        };
        assert!(self.orders.try_recv().is_err(), "no order expected");
        outcome
    }

    /// Deliver a response that must resume a step.
    pub async fn respond(&self, response: TaskResponse) -> StepOutcome {
        self.orchestrator
            .handle_response(response)
            .await
            .expect("response should be handled")
            .expect("a step should be awaiting")
    }

    pub async fn next_order(&mut self) -> WorkOrder {
        tokio::time::timeout(Duration::from_secs(5), self.orders.recv())
            .await
            .expect("order within timeout")
            .expect("queue open")
    }

    /// Run setup to completion against the given groups.
    pub async fn complete_setup(
        &mut self,
        run: &WorkflowRunContext,
        params: SetupParams,
        new_group: ScalingGroupConfig,
        old_group: Option<ScalingGroupConfig>,
    ) -> StepOutcome {
        let (correlation_id, _) = self
            .dispatch(run, StepSpec::forward("Setup", StepKind::Setup(params)))
            .await;
        let outcome = self
            .respond(TaskResponse::success(
                correlation_id.as_str(),
                TaskResult::Setup {
                    new_group,
                    old_group,
                },
            ))
            .await;
        assert!(outcome.is_success(), "setup failed: {:?}", outcome);
        outcome
    }
}

/// A fresh run for service `svc`.
pub fn new_run() -> WorkflowRunContext {
    WorkflowRunContext::new(
        Uuid::new_v4().to_string(),
        "app-1",
        "env-1",
        "svc-1",
        "acc-1",
    )
}

pub fn wiring() -> LoadBalancerWiring {
    LoadBalancerWiring {
        load_balancer: "web-lb".to_string(),
        prod_listener_port: 443,
        stage_listener_port: Some(8443),
        prod_target_group: "tg-blue".to_string(),
        stage_target_group: Some("tg-green".to_string()),
    }
}

/// Rolling or canary setup with an explicit full-scale capacity.
pub fn rolling_setup(capacity: Capacity, strategy: ResizeStrategy) -> SetupParams {
    SetupParams {
        name_prefix: "web".to_string(),
        region: "us-east-1".to_string(),
        blue_green: false,
        resize_strategy: strategy,
        initial_capacity: InitialCapacity::Fixed { capacity },
        load_balancers: vec![],
    }
}

/// Blue/green setup that copies the running group's capacity.
pub fn blue_green_setup(fallback: Capacity) -> SetupParams {
    SetupParams {
        name_prefix: "web".to_string(),
        region: "us-east-1".to_string(),
        blue_green: true,
        resize_strategy: ResizeStrategy::DownsizeOldFirst,
        initial_capacity: InitialCapacity::UseCurrentRunning { fallback },
        load_balancers: vec![wiring()],
    }
}

pub fn deploy_percent(percent: u32) -> StepKind {
    StepKind::Deploy(DeployParams {
        upsize: InstanceRequest::percentage(percent),
        downsize_override: None,
    })
}

pub fn listener(downsize_old: bool, traffic_weight: Option<u8>) -> StepKind {
    StepKind::ListenerSwitch(ListenerParams {
        downsize_old,
        traffic_weight,
    })
}

pub fn new_group() -> ScalingGroupConfig {
    ScalingGroupConfig::new("sg-new", "web__2", Capacity::zero())
}

pub fn old_group(capacity: Capacity) -> ScalingGroupConfig {
    ScalingGroupConfig::new("sg-old", "web__1", capacity)
}

pub fn instance(id: &str, group_id: &str) -> InstanceInfo {
    InstanceInfo {
        instance_id: id.to_string(),
        private_ip: None,
        group_id: group_id.to_string(),
    }
}
