// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Network servers for shiftwise-core.
//!
//! - Worker Server: accepts connections from remote worker agents, pushes
//!   work orders and collects task responses

pub mod worker_server;

pub use worker_server::{WorkerHub, run_worker_server};
