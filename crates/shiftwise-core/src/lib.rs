// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shiftwise Core - Scaling-Group Deployment Orchestrator
//!
//! This crate drives blue/green, canary and rolling deployments of cloud
//! scaling groups. It plans capacity per phase, dispatches work orders to
//! remote workers, resumes steps when their responses arrive, and hands
//! context from one step to the next through durable records.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         Workflow Engine                                  │
//! │               (calls execute / handle_response per step)                 │
//! └─────────────────────────────────────────────────────────────────────────┘
//!                                    │
//!                                    ▼
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                          Orchestrator                                    │
//! │     Step controller ── Capacity planner ── Command-unit tracker          │
//! └─────────────────────────────────────────────────────────────────────────┘
//!           │                                              │
//!           │ Handoff records, awaiting steps              │ Work orders
//!           ▼                                              ▼
//! ┌───────────────────────┐                    ┌─────────────────────────────┐
//! │        SQLite         │                    │  Worker Server (TCP 8101)   │
//! │  (Durable Storage)    │                    │  ◄── remote worker agents   │
//! └───────────────────────┘                    └─────────────────────────────┘
//! ```
//!
//! # Step Lifecycle
//!
//! Every step is a small state machine:
//!
//! 1. **`execute`**: validates input, reads the setup record, plans the
//!    operation, records an activity and a pending step execution, and
//!    submits a work order. Returns `Suspended` with the correlation id.
//! 2. **`handle_response`**: claims the awaiting step for the correlation id,
//!    classifies the response (timeout always wins), writes handoff records
//!    on success, and moves the step to a terminal status. The terminal
//!    status and the removal of the registration commit together.
//!
//! A step never transitions twice. Responses for unknown or already finished
//! correlation ids are logged and ignored. A resume that fails before its
//! commit leaves the step registered, so the same response can be delivered
//! again. Registrations keep the work order: orders are resent on startup and
//! steps past their deadline are failed with a timeout.
//!
//! # Handoff Records
//!
//! | Key prefix | Written by | Read by |
//! |------------|-----------|---------|
//! | `setupContext-` | setup (write-once) | every later step, every rollback |
//! | `instanceList-` | deploy forward | verification steps |
//! | `trafficWeight-` | weighted listener switch | listener rollback |
//! | `allPhaseRollbackDone-` | deploy rollback | later deploy rollbacks |
//!
//! Keys are suffixed with the trimmed service id and scoped to the workflow
//! execution id.
//!
//! # Recurring Jobs
//!
//! The [`scheduler`] module runs housekeeping jobs on the primary instance
//! only, with per-account permits, exponential backoff and alerting after
//! repeated failures. The server runs step expiry and the retention of
//! finished runs this way.
//!
//! # Configuration
//!
//! See [`config::Config`] for the environment variables read by the server
//! binary.

#![deny(missing_docs)]

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod handoff;
pub mod persistence;
pub mod planner;
pub mod run;
pub mod runtime;
pub mod scheduler;
pub mod server;
pub mod step;
pub mod tracker;

pub use dispatcher::{ChannelTaskQueue, CorrelationId, TaskQueue};
pub use engine::Orchestrator;
pub use error::{CoreError, StepError};
pub use persistence::{Persistence, SqlitePersistence};
pub use run::WorkflowRunContext;
pub use runtime::OrchestratorRuntime;
pub use step::{Direction, Execution, StepKind, StepOutcome, StepSpec, StepStatus};
