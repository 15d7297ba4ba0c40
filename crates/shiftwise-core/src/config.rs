// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration loading from environment variables.

use std::net::SocketAddr;
use std::time::Duration;

/// Shiftwise orchestrator configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// SQLite connection URL
    pub database_url: String,
    /// TCP address remote workers connect to
    pub worker_addr: SocketAddr,
    /// Remote timeout used when a step does not set one
    pub default_timeout_minutes: u32,
    /// Identity of this process in leader election
    pub instance_id: String,
    /// How often the recurring job runner ticks
    pub job_poll_interval: Duration,
    /// Age after which finished runs are garbage-collected
    pub run_retention_days: u32,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Required:
    /// - `SHIFTWISE_DATABASE_URL`: SQLite connection string
    ///
    /// Optional (with defaults):
    /// - `SHIFTWISE_WORKER_PORT`: worker link port (default: 8101)
    /// - `SHIFTWISE_DEFAULT_TIMEOUT_MINUTES`: remote timeout (default: 10)
    /// - `SHIFTWISE_INSTANCE_ID`: leader election identity (default: random uuid)
    /// - `SHIFTWISE_JOB_POLL_INTERVAL_SECS`: job runner tick (default: 60)
    /// - `SHIFTWISE_RUN_RETENTION_DAYS`: finished run retention (default: 30)
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("SHIFTWISE_DATABASE_URL")
            .map_err(|_| ConfigError::Missing("SHIFTWISE_DATABASE_URL"))?;

        let worker_port: u16 = std::env::var("SHIFTWISE_WORKER_PORT")
            .unwrap_or_else(|_| "8101".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid("SHIFTWISE_WORKER_PORT", "must be a valid port number")
            })?;

        let default_timeout_minutes: u32 = std::env::var("SHIFTWISE_DEFAULT_TIMEOUT_MINUTES")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .ok()
            .filter(|minutes| *minutes > 0)
            .ok_or(ConfigError::Invalid(
                "SHIFTWISE_DEFAULT_TIMEOUT_MINUTES",
                "must be a positive integer",
            ))?;

        let instance_id = std::env::var("SHIFTWISE_INSTANCE_ID")
            .ok()
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let poll_secs: u64 = std::env::var("SHIFTWISE_JOB_POLL_INTERVAL_SECS")
            .unwrap_or_else(|_| "60".to_string())
            .parse()
            .ok()
            .filter(|secs| *secs > 0)
            .ok_or(ConfigError::Invalid(
                "SHIFTWISE_JOB_POLL_INTERVAL_SECS",
                "must be a positive integer",
            ))?;

        let run_retention_days: u32 = std::env::var("SHIFTWISE_RUN_RETENTION_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                ConfigError::Invalid(
                    "SHIFTWISE_RUN_RETENTION_DAYS",
                    "must be a non-negative integer",
                )
            })?;

        Ok(Self {
            database_url,
            worker_addr: SocketAddr::from(([0, 0, 0, 0], worker_port)),
            default_timeout_minutes,
            instance_id,
            job_poll_interval: Duration::from_secs(poll_secs),
            run_retention_days,
        })
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("missing required environment variable: {0}")]
    Missing(&'static str),

    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}
