// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Database migrations for trellis-orchestrator.
//!
//! Products embedding the orchestrator call [`run`] once at startup to set up
//! the allocation, run and sub-unit status tables.
//!
//! # Example
//!
//! ```ignore
//! use sqlx::PgPool;
//! use trellis_orchestrator::migrations;
//!
//! let pool = PgPool::connect(&database_url).await?;
//! migrations::run(&pool).await?;
//! ```

use sqlx::migrate::{MigrateError, Migrator};

/// PostgreSQL migrator with all migrations embedded.
pub static POSTGRES: Migrator = sqlx::migrate!("./migrations");

/// Run PostgreSQL migrations.
///
/// Safe to call multiple times; already-applied migrations are skipped.
pub async fn run(pool: &sqlx::PgPool) -> Result<(), MigrateError> {
    POSTGRES.run(pool).await
}
