// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shiftwise Protocol - worker link messages and framing
//!
//! This crate defines what travels between the shiftwise orchestrator and the
//! remote worker agents that perform the actual cloud calls.
//!
//! ```text
//! ┌──────────────────────┐   WorkOrder (frame type 2)   ┌──────────────────┐
//! │  shiftwise-core      │─────────────────────────────►│  worker agent    │
//! │  (orchestrator)      │◄─────────────────────────────│  (cloud clients) │
//! └──────────────────────┘  TaskResponse (frame type 3) └──────────────────┘
//! ```
//!
//! Workers open a TCP connection, send a [`WorkerHello`], then receive work
//! orders and answer each with a [`TaskResponse`] whose `correlation_id`
//! equals the order's `activity_id`.

pub mod frame;
pub mod messages;

pub use frame::{Frame, FrameError, FramedStream, MessageType, read_frame, write_frame};
pub use messages::{
    Capacity, ExecutionStatus, FailureType, InstanceInfo, InstanceUnit, LoadBalancerWiring,
    OperationParams, ResizeStrategy, ScalingGroupConfig, TaskCommand, TaskResponse, TaskResult,
    WorkOrder, WorkerHello,
};
