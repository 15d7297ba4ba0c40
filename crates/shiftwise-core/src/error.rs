// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for shiftwise-core.
//!
//! [`CoreError`] is the internal error of persistence, handoff and dispatch.
//! [`StepError`] is the only shape the workflow engine sees at a step
//! boundary; every internal failure is folded into it.

use thiserror::Error;

/// Result type using CoreError
pub type Result<T> = std::result::Result<T, CoreError>;

/// Core errors that can occur below the step boundary.
#[derive(Debug, Clone, Error)]
#[non_exhaustive]
pub enum CoreError {
    /// A write-once handoff record was written a second time.
    #[error("Handoff record '{key}' already exists for run '{workflow_execution_id}'")]
    HandoffAlreadyExists {
        /// Run the record belongs to.
        workflow_execution_id: String,
        /// Record key.
        key: String,
    },

    /// Step execution data was not found.
    #[error("Step execution '{activity_id}' not found")]
    StepExecutionNotFound {
        /// Activity id of the step.
        activity_id: String,
    },

    /// A terminal step execution was asked to transition again.
    #[error("Step execution '{activity_id}' is already terminal")]
    StepAlreadyTerminal {
        /// Activity id of the step.
        activity_id: String,
    },

    /// A correlation id already has an awaiting step registered.
    #[error("Correlation id '{correlation_id}' already has an outstanding work order")]
    DuplicateCorrelation {
        /// The correlation id.
        correlation_id: String,
    },

    /// The task queue refused the work order.
    #[error("Task queue unavailable: {0}")]
    QueueUnavailable(String),

    /// Input validation failed.
    #[error("Validation error for '{field}': {message}")]
    ValidationError {
        /// The field that failed validation.
        field: String,
        /// The validation error message.
        message: String,
    },

    /// Database operation failed.
    #[error("Database error during '{operation}': {details}")]
    DatabaseError {
        /// The operation that failed.
        operation: String,
        /// Error details.
        details: String,
    },

    /// Stored JSON could not be (de)serialized.
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl CoreError {
    /// Get the error code string for this error type.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::HandoffAlreadyExists { .. } => "HANDOFF_ALREADY_EXISTS",
            Self::StepExecutionNotFound { .. } => "STEP_EXECUTION_NOT_FOUND",
            Self::StepAlreadyTerminal { .. } => "STEP_ALREADY_TERMINAL",
            Self::DuplicateCorrelation { .. } => "DUPLICATE_CORRELATION",
            Self::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            Self::ValidationError { .. } => "VALIDATION_ERROR",
            Self::DatabaseError { .. } => "DATABASE_ERROR",
            Self::Serialization(_) => "SERIALIZATION_ERROR",
        }
    }

    /// Shorthand for a validation error.
    pub fn validation(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ValidationError {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl From<sqlx::Error> for CoreError {
    fn from(err: sqlx::Error) -> Self {
        CoreError::DatabaseError {
            operation: "query".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for CoreError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        CoreError::DatabaseError {
            operation: "migrate".to_string(),
            details: err.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

/// Error returned from `execute` and `on_response`.
///
/// Local failures are never retried by this layer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StepError {
    /// The step could not run with the given inputs or state.
    #[error("Invalid request: {message}")]
    InvalidRequest {
        /// User-visible reason.
        message: String,
    },
}

impl StepError {
    /// Build an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// The user-visible message.
    pub fn message(&self) -> &str {
        match self {
            Self::InvalidRequest { message } => message,
        }
    }
}

impl From<CoreError> for StepError {
    fn from(err: CoreError) -> Self {
        StepError::invalid_request(err.to_string())
    }
}
