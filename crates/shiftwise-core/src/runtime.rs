// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for shiftwise-core.
//!
//! [`OrchestratorRuntime`] wires an [`Orchestrator`] to an inbound response
//! channel and runs the router that resumes awaiting steps as responses
//! arrive. Transports (the worker server, a message bus consumer, a test)
//! push [`TaskResponse`]s into [`OrchestratorRuntime::inbound`].
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use shiftwise_core::dispatcher::ChannelTaskQueue;
//! use shiftwise_core::persistence::SqlitePersistence;
//! use shiftwise_core::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let persistence = Arc::new(SqlitePersistence::from_path(".data/shiftwise.db").await?);
//!     let (queue, orders) = ChannelTaskQueue::new();
//!
//!     let runtime = OrchestratorRuntime::builder()
//!         .persistence(persistence)
//!         .queue(Arc::new(queue))
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     // ... hand `orders` to workers, feed responses into runtime.inbound() ...
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

use anyhow::Result;
use shiftwise_protocol::TaskResponse;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info};

use crate::dispatcher::TaskQueue;
use crate::engine::{DEFAULT_TIMEOUT_MINUTES, Orchestrator};
use crate::persistence::Persistence;

/// Builder for creating an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    queue: Option<Arc<dyn TaskQueue>>,
    default_timeout_minutes: u32,
    inbound_capacity: usize,
}

impl std::fmt::Debug for OrchestratorRuntimeBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeBuilder")
            .field("persistence", &self.persistence.as_ref().map(|_| "..."))
            .field("queue", &self.queue.as_ref().map(|_| "..."))
            .field("default_timeout_minutes", &self.default_timeout_minutes)
            .field("inbound_capacity", &self.inbound_capacity)
            .finish()
    }
}

impl Default for OrchestratorRuntimeBuilder {
    fn default() -> Self {
        Self {
            persistence: None,
            queue: None,
            default_timeout_minutes: DEFAULT_TIMEOUT_MINUTES,
            inbound_capacity: 1024,
        }
    }
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence layer (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the outbound task queue (required).
    pub fn queue(mut self, queue: Arc<dyn TaskQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Remote timeout for steps that set none.
    ///
    /// Default: 10 minutes
    pub fn default_timeout_minutes(mut self, minutes: u32) -> Self {
        self.default_timeout_minutes = minutes;
        self
    }

    /// Capacity of the inbound response channel.
    ///
    /// Default: 1024
    pub fn inbound_capacity(mut self, capacity: usize) -> Self {
        self.inbound_capacity = capacity.max(1);
        self
    }

    /// Build the runtime configuration.
    ///
    /// Returns an error if required fields are missing.
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;
        let queue = self
            .queue
            .ok_or_else(|| anyhow::anyhow!("queue is required"))?;
        if self.default_timeout_minutes == 0 {
            anyhow::bail!("default_timeout_minutes must be positive");
        }

        Ok(OrchestratorRuntimeConfig {
            persistence,
            queue,
            default_timeout_minutes: self.default_timeout_minutes,
            inbound_capacity: self.inbound_capacity,
        })
    }
}

/// Configuration for an [`OrchestratorRuntime`].
pub struct OrchestratorRuntimeConfig {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn TaskQueue>,
    default_timeout_minutes: u32,
    inbound_capacity: usize,
}

impl std::fmt::Debug for OrchestratorRuntimeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrchestratorRuntimeConfig")
            .field("persistence", &"...")
            .field("queue", &"...")
            .field("default_timeout_minutes", &self.default_timeout_minutes)
            .field("inbound_capacity", &self.inbound_capacity)
            .finish()
    }
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the response router.
    ///
    /// Orders of steps still awaiting a response from before a restart are
    /// enqueued again first.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let orchestrator =
            Orchestrator::new(self.persistence, self.queue, self.default_timeout_minutes);
        let redelivered = orchestrator.redeliver_outstanding().await?;
        if redelivered > 0 {
            info!(redelivered, "Resent work orders of awaiting steps");
        }

        let (inbound_tx, inbound_rx) = mpsc::channel(self.inbound_capacity);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let router_handle = tokio::spawn(route_responses(
            orchestrator.clone(),
            inbound_rx,
            shutdown_rx,
        ));

        info!("OrchestratorRuntime started");

        Ok(OrchestratorRuntime {
            orchestrator,
            inbound_tx,
            shutdown_tx,
            router_handle,
        })
    }
}

/// A running orchestrator that can be embedded in an application.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    orchestrator: Orchestrator,
    inbound_tx: mpsc::Sender<TaskResponse>,
    shutdown_tx: watch::Sender<bool>,
    router_handle: JoinHandle<()>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Orchestrator for executing steps.
    pub fn orchestrator(&self) -> &Orchestrator {
        &self.orchestrator
    }

    /// Sender transports use to deliver worker responses.
    pub fn inbound(&self) -> mpsc::Sender<TaskResponse> {
        self.inbound_tx.clone()
    }

    /// Receiver that flips to `true` on shutdown, for transports to follow.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops accepting responses, applies the ones already received and
    /// waits for every resume in flight. Steps still awaiting a response stay
    /// registered and resume after restart.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        let _ = self.shutdown_tx.send(true);

        match self.router_handle.await {
            Ok(()) => {
                info!("OrchestratorRuntime shutdown complete");
                Ok(())
            }
            Err(e) => {
                error!("OrchestratorRuntime router task panicked: {}", e);
                Err(anyhow::anyhow!("router task panicked: {}", e))
            }
        }
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.router_handle.is_finished()
    }
}

/// Resume awaiting steps as responses arrive, one task per response.
async fn route_responses(
    orchestrator: Orchestrator,
    mut inbound_rx: mpsc::Receiver<TaskResponse>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            biased;

            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    info!("Response router received shutdown signal");
                    break;
                }
            }

            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                log_join(joined);
            }

            response = inbound_rx.recv() => {
                let Some(response) = response else {
                    debug!("Inbound channel closed");
                    break;
                };
                in_flight.spawn(resume(orchestrator.clone(), response));
            }
        }
    }

    // responses already accepted from a transport are applied before exit
    inbound_rx.close();
    while let Some(response) = inbound_rx.recv().await {
        in_flight.spawn(resume(orchestrator.clone(), response));
    }
    if !in_flight.is_empty() {
        info!(in_flight = in_flight.len(), "Waiting for in-flight resumes");
    }
    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }

    info!("Response router stopped");
}

async fn resume(orchestrator: Orchestrator, response: TaskResponse) {
    let correlation_id = response.correlation_id.clone();
    match orchestrator.handle_response(response).await {
        Ok(Some(outcome)) => {
            debug!(%correlation_id, status = outcome.status.as_str(), "Response handled");
        }
        Ok(None) => {}
        Err(e) => {
            // the step stays registered for a redelivery or the expiry job
            error!(%correlation_id, error = %e, "Failed to resume step");
        }
    }
}

fn log_join(joined: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        error!(error = %e, "Resume task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::ChannelTaskQueue;
    use crate::persistence::SqlitePersistence;

    #[tokio::test]
    async fn test_builder_requires_persistence() {
        let (queue, _rx) = ChannelTaskQueue::new();
        let err = OrchestratorRuntime::builder()
            .queue(Arc::new(queue))
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("persistence"));
    }

    #[tokio::test]
    async fn test_builder_requires_queue() {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let err = OrchestratorRuntime::builder()
            .persistence(persistence)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("queue"));
    }

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (queue, _rx) = ChannelTaskQueue::new();

        let runtime = OrchestratorRuntime::builder()
            .persistence(persistence)
            .queue(Arc::new(queue))
            .default_timeout_minutes(5)
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        assert!(runtime.is_running());
        let mut signal = runtime.shutdown_signal();
        runtime.shutdown().await.unwrap();
        assert!(*signal.borrow_and_update());
    }

    #[tokio::test]
    async fn test_shutdown_applies_received_responses() {
        use crate::run::WorkflowRunContext;
        use crate::step::{Execution, InitialCapacity, SetupParams, StepKind, StepSpec, StepStatus};
        use shiftwise_protocol::{Capacity, ResizeStrategy, ScalingGroupConfig, TaskResult};

        let persistence = Arc::new(SqlitePersistence::in_memory().await.unwrap());
        let (queue, mut orders) = ChannelTaskQueue::new();
        let runtime = OrchestratorRuntime::builder()
            .persistence(persistence)
            .queue(Arc::new(queue))
            .build()
            .unwrap()
            .start()
            .await
            .unwrap();

        let run = WorkflowRunContext::new("run-1", "app", "env", "svc", "acc");
        let execution = runtime
            .orchestrator()
            .execute(
                &run,
                StepSpec::forward(
                    "Setup",
                    StepKind::Setup(SetupParams {
                        name_prefix: "web".to_string(),
                        region: "us-east-1".to_string(),
                        blue_green: false,
                        resize_strategy: ResizeStrategy::DownsizeOldFirst,
                        initial_capacity: InitialCapacity::Fixed {
                            capacity: Capacity::pinned(2),
                        },
                        load_balancers: vec![],
                    }),
                ),
            )
            .await
            .unwrap();
        let Execution::Suspended { correlation_id } = execution else {
            panic!("setup should suspend");
        };
        orders.recv().await.unwrap();

        runtime
            .inbound()
            .send(TaskResponse::success(
                correlation_id.as_str(),
                TaskResult::Setup {
                    new_group: ScalingGroupConfig::new("sg-new", "web__1", Capacity::zero()),
                    old_group: None,
                },
            ))
            .await
            .unwrap();
        let orchestrator = runtime.orchestrator().clone();
        runtime.shutdown().await.unwrap();

        let data = orchestrator
            .step_execution(correlation_id.as_str())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(data.status, StepStatus::Success);
        assert_eq!(orchestrator.outstanding().await.unwrap(), 0);
    }
}
