// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task dispatch and response correlation.
//!
//! A step never waits in-process. [`Dispatcher::submit`] durably registers the
//! suspended step, together with the order itself, under the order's
//! correlation id and then enqueues the order.
//!
//! When a response arrives, [`Dispatcher::claim`] takes a short-lived claim
//! on the registration, so concurrent deliveries resume the step once. The
//! registration is deleted in the same transaction as the step's terminal
//! status. If resuming fails before that commit the claim is released (or
//! simply expires after a crash) and a redelivered response resumes the step.
//!
//! Orders of registrations nobody has claimed can be sent again with
//! [`Dispatcher::redeliver`], and registrations past their deadline are
//! listed by [`Dispatcher::overdue`].

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use shiftwise_protocol::{ExecutionStatus, FailureType, TaskResponse, WorkOrder};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::persistence::Persistence;

/// Minutes a worker gets past the order's own timeout before the step is
/// failed with a timeout.
pub const RESPONSE_GRACE_MINUTES: i64 = 5;

/// How long a claim blocks other deliveries of the same response.
pub const CLAIM_TTL_SECS: i64 = 120;

/// Opaque token linking a work order to its awaiting step.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Fresh random id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// String form.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Outbound queue of work orders.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Hand an order to the transport. Returning means queued, not executed.
    async fn enqueue(&self, order: WorkOrder) -> Result<()>;
}

/// In-process queue backed by an unbounded channel.
#[derive(Clone)]
pub struct ChannelTaskQueue {
    tx: mpsc::UnboundedSender<WorkOrder>,
}

impl ChannelTaskQueue {
    /// Create the queue and the receiving end a worker drains.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<WorkOrder>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl TaskQueue for ChannelTaskQueue {
    async fn enqueue(&self, order: WorkOrder) -> Result<()> {
        self.tx
            .send(order)
            .map_err(|_| CoreError::QueueUnavailable("receiver dropped".to_string()))
    }
}

/// Classification of a worker response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// The command succeeded.
    Success,
    /// The command failed with the given classification.
    Failed(FailureType),
}

/// Classify a response. A timeout failure type always wins.
pub fn classify(response: &TaskResponse) -> ResponseOutcome {
    if response.is_timeout() {
        return ResponseOutcome::Failed(FailureType::Timeout);
    }
    match response.status {
        ExecutionStatus::Success => ResponseOutcome::Success,
        ExecutionStatus::Failure => ResponseOutcome::Failed(
            response.failure_type.unwrap_or(FailureType::GenericFailure),
        ),
    }
}

/// Submits work orders and hands suspended steps back on response.
#[derive(Clone)]
pub struct Dispatcher {
    persistence: Arc<dyn Persistence>,
    queue: Arc<dyn TaskQueue>,
}

impl Dispatcher {
    /// Create a dispatcher.
    pub fn new(persistence: Arc<dyn Persistence>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { persistence, queue }
    }

    /// Register `awaiting` under the order's activity id, then enqueue.
    ///
    /// If the queue refuses the order the registration is removed again.
    pub async fn submit<A: Serialize + Sync>(
        &self,
        order: WorkOrder,
        awaiting: &A,
    ) -> Result<CorrelationId> {
        let correlation_id = CorrelationId::from(order.activity_id.clone());
        let payload = serde_json::to_string(awaiting)?;
        let work_order = serde_json::to_string(&order)?;
        let expires_at = Utc::now()
            + Duration::minutes(i64::from(order.timeout_minutes) + RESPONSE_GRACE_MINUTES);

        self.persistence
            .register_awaiting(
                correlation_id.as_str(),
                &order.workflow_execution_id,
                &payload,
                &work_order,
                expires_at,
            )
            .await?;

        let command = order.command_name;
        if let Err(e) = self.queue.enqueue(order).await {
            if let Err(undo) = self.persistence.remove_awaiting(correlation_id.as_str()).await {
                warn!(
                    correlation_id = %correlation_id,
                    error = %undo,
                    "Failed to remove registration after enqueue failure"
                );
            }
            return Err(e);
        }

        debug!(
            correlation_id = %correlation_id,
            command = command.as_str(),
            "Work order dispatched"
        );
        Ok(correlation_id)
    }

    /// Claim the step registered under `correlation_id`.
    ///
    /// Returns `None` if nothing is registered or another delivery holds the
    /// claim. The registration stays until the step's terminal status is
    /// written; call [`release`](Self::release) if resuming fails first.
    pub async fn claim<A: DeserializeOwned>(
        &self,
        correlation_id: &CorrelationId,
    ) -> Result<Option<A>> {
        let claimed_until = Utc::now() + Duration::seconds(CLAIM_TTL_SECS);
        match self
            .persistence
            .claim_awaiting(correlation_id.as_str(), claimed_until)
            .await?
        {
            Some(record) => Ok(Some(serde_json::from_str(&record.payload)?)),
            None => Ok(None),
        }
    }

    /// Give up a claim so the next delivery can resume the step.
    pub async fn release(&self, correlation_id: &CorrelationId) -> Result<()> {
        self.persistence
            .release_awaiting(correlation_id.as_str())
            .await
    }

    /// Enqueue again the orders of up to `limit` unclaimed registrations.
    ///
    /// Workers may see an order twice; the second response finds no
    /// registration and is ignored.
    pub async fn redeliver(&self, limit: i64) -> Result<usize> {
        let records = self.persistence.list_unclaimed_awaiting(limit).await?;
        let mut sent = 0;
        for record in records {
            let order: WorkOrder = match serde_json::from_str(&record.work_order) {
                Ok(order) => order,
                Err(e) => {
                    warn!(
                        correlation_id = %record.correlation_id,
                        error = %e,
                        "Stored work order unreadable, not redelivered"
                    );
                    continue;
                }
            };
            self.queue.enqueue(order).await?;
            sent += 1;
        }
        if sent > 0 {
            info!(sent, "Outstanding work orders redelivered");
        }
        Ok(sent)
    }

    /// Orders of up to `limit` unclaimed registrations past their deadline.
    pub async fn overdue(&self, as_of: DateTime<Utc>, limit: i64) -> Result<Vec<WorkOrder>> {
        let records = self.persistence.list_expired_awaiting(as_of, limit).await?;
        let mut orders = Vec::with_capacity(records.len());
        for record in records {
            orders.push(serde_json::from_str(&record.work_order)?);
        }
        Ok(orders)
    }

    /// Correlation ids still registered for a run.
    pub async fn registered_for_run(&self, workflow_execution_id: &str) -> Result<Vec<CorrelationId>> {
        let ids = self
            .persistence
            .list_run_awaiting(workflow_execution_id)
            .await?;
        Ok(ids.into_iter().map(CorrelationId::from).collect())
    }

    /// Number of steps still waiting for a response.
    pub async fn outstanding(&self) -> Result<i64> {
        self.persistence.count_awaiting().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::SqlitePersistence;
    use shiftwise_protocol::{OperationParams, TaskCommand, TaskResult};

    struct ClosedQueue;

    #[async_trait]
    impl TaskQueue for ClosedQueue {
        async fn enqueue(&self, _order: WorkOrder) -> Result<()> {
            Err(CoreError::QueueUnavailable("closed".to_string()))
        }
    }

    fn order(activity_id: &str) -> WorkOrder {
        WorkOrder {
            account_id: "acc".to_string(),
            app_id: "app".to_string(),
            activity_id: activity_id.to_string(),
            region: "us-east-1".to_string(),
            command_name: TaskCommand::Resize,
            workflow_execution_id: "run-1".to_string(),
            rollback: false,
            blue_green: false,
            timeout_minutes: 10,
            old_group_config: None,
            new_group_config: None,
            operation: OperationParams::Resize {
                resize_new_first: false,
            },
        }
    }

    async fn persistence() -> Arc<dyn Persistence> {
        Arc::new(SqlitePersistence::in_memory().await.unwrap())
    }

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&TaskResponse::success("a", TaskResult::Empty)),
            ResponseOutcome::Success
        );
        assert_eq!(
            classify(&TaskResponse::failure("a", FailureType::Timeout, "late")),
            ResponseOutcome::Failed(FailureType::Timeout)
        );
        assert_eq!(
            classify(&TaskResponse::failure(
                "a",
                FailureType::GenericFailure,
                "boom"
            )),
            ResponseOutcome::Failed(FailureType::GenericFailure)
        );

        let mut untyped = TaskResponse::success("a", TaskResult::Empty);
        untyped.status = ExecutionStatus::Failure;
        assert_eq!(
            classify(&untyped),
            ResponseOutcome::Failed(FailureType::GenericFailure)
        );

        // a timeout tag overrides a contradictory status
        let mut odd = TaskResponse::success("a", TaskResult::Empty);
        odd.failure_type = Some(FailureType::Timeout);
        assert_eq!(classify(&odd), ResponseOutcome::Failed(FailureType::Timeout));
    }

    #[tokio::test]
    async fn test_submit_then_claim_once() {
        let (queue, mut rx) = ChannelTaskQueue::new();
        let dispatcher = Dispatcher::new(persistence().await, Arc::new(queue));

        let correlation_id = dispatcher
            .submit(order("act-1"), &"suspended".to_string())
            .await
            .unwrap();
        assert_eq!(correlation_id.as_str(), "act-1");

        let received = rx.recv().await.unwrap();
        assert_eq!(received.activity_id, "act-1");
        assert_eq!(dispatcher.outstanding().await.unwrap(), 1);

        let claimed: Option<String> = dispatcher.claim(&correlation_id).await.unwrap();
        assert_eq!(claimed.as_deref(), Some("suspended"));

        // held by the first claimer
        let again: Option<String> = dispatcher.claim(&correlation_id).await.unwrap();
        assert!(again.is_none());
        assert_eq!(dispatcher.outstanding().await.unwrap(), 1);

        // released after a failed resume, the next delivery gets it
        dispatcher.release(&correlation_id).await.unwrap();
        let retried: Option<String> = dispatcher.claim(&correlation_id).await.unwrap();
        assert_eq!(retried.as_deref(), Some("suspended"));
    }

    #[tokio::test]
    async fn test_redeliver_skips_claimed_orders() {
        let (queue, mut rx) = ChannelTaskQueue::new();
        let dispatcher = Dispatcher::new(persistence().await, Arc::new(queue));

        let a = dispatcher.submit(order("act-a"), &1u32).await.unwrap();
        dispatcher.submit(order("act-b"), &2u32).await.unwrap();
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();

        let _: Option<u32> = dispatcher.claim(&a).await.unwrap();
        assert_eq!(dispatcher.redeliver(100).await.unwrap(), 1);
        assert_eq!(rx.recv().await.unwrap().activity_id, "act-b");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_overdue_uses_order_timeout_plus_grace() {
        let (queue, _rx) = ChannelTaskQueue::new();
        let dispatcher = Dispatcher::new(persistence().await, Arc::new(queue));

        dispatcher.submit(order("act-1"), &1u32).await.unwrap();
        let registered = dispatcher.registered_for_run("run-1").await.unwrap();
        assert_eq!(registered, vec![CorrelationId::from("act-1")]);

        // order timeout is 10 minutes
        let before = Utc::now() + Duration::minutes(10 + RESPONSE_GRACE_MINUTES - 1);
        assert!(dispatcher.overdue(before, 10).await.unwrap().is_empty());

        let after = Utc::now() + Duration::minutes(10 + RESPONSE_GRACE_MINUTES + 1);
        let overdue = dispatcher.overdue(after, 10).await.unwrap();
        assert_eq!(overdue.len(), 1);
        assert_eq!(overdue[0].activity_id, "act-1");
        assert_eq!(overdue[0].timeout_minutes, 10);
    }

    #[tokio::test]
    async fn test_submit_rejects_duplicate_correlation() {
        let (queue, _rx) = ChannelTaskQueue::new();
        let dispatcher = Dispatcher::new(persistence().await, Arc::new(queue));

        dispatcher.submit(order("act-1"), &1u32).await.unwrap();
        let err = dispatcher.submit(order("act-1"), &2u32).await.unwrap_err();
        assert_eq!(err.error_code(), "DUPLICATE_CORRELATION");
    }

    #[tokio::test]
    async fn test_failed_enqueue_removes_registration() {
        let dispatcher = Dispatcher::new(persistence().await, Arc::new(ClosedQueue));

        let err = dispatcher.submit(order("act-1"), &1u32).await.unwrap_err();
        assert_eq!(err.error_code(), "QUEUE_UNAVAILABLE");
        assert_eq!(dispatcher.outstanding().await.unwrap(), 0);
    }

    #[test]
    fn test_correlation_ids_are_unique() {
        assert_ne!(CorrelationId::generate(), CorrelationId::generate());
    }
}
