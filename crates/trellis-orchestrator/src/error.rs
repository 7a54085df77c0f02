// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for trellis-orchestrator.

use thiserror::Error;

/// Orchestration errors.
///
/// Configuration, allocation and computation failures are separate variants so
/// callers can match on the failure kind instead of inspecting messages.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Configuration loading or validation failed.
    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Database operation failed.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Database migration failed.
    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The orchestrator client reported an error.
    #[error("Orchestrator error: {0}")]
    Orchestrator(#[from] crate::orchestrator::OrchestratorError),

    /// A compute resource could not be allocated.
    ///
    /// The allocation row (if one was written) carries the same message in
    /// its `in_error` status.
    #[error("Allocation {allocation_id:?} failed: {message}")]
    Allocation {
        /// Allocation row ID, when the row was created before the failure.
        allocation_id: Option<i64>,
        /// Failure description.
        message: String,
    },

    /// An execution run did not complete (allocation or computation failure).
    #[error("Execution error: {0}")]
    Computation(#[from] crate::supervisor::ExecutionError),

    /// Quantity parsing failed.
    #[error("Unit error: {0}")]
    Unit(#[from] crate::units::UnitError),

    /// Study has no row in the authoritative store.
    #[error("Study not found: {0}")]
    StudyNotFound(i64),

    /// Execution run was not found.
    #[error("Execution run not found: {0}")]
    RunNotFound(i64),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the orchestrator Error.
pub type Result<T> = std::result::Result<T, Error>;
