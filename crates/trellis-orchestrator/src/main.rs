// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis Orchestrator - Reconcile Daemon
//!
//! Standalone process that keeps allocation rows in sync with the container
//! orchestrator and garbage collects completed batch allocations. Studies are
//! computed by the embedding application, not by this binary.

use std::sync::Arc;
use tracing::{info, warn};

use trellis_orchestrator::config::{Config, ConfigError, ExecutionStrategy};
use trellis_orchestrator::migrations;
use trellis_orchestrator::orchestrator::{KubectlOrchestrator, Orchestrator};
use trellis_orchestrator::persistence::PostgresPersistence;
use trellis_orchestrator::runtime::OrchestratorRuntime;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "trellis_orchestrator=info".into()),
        )
        .init();

    // Load .env file if present
    if let Err(e) = dotenvy::dotenv() {
        warn!("No .env file loaded: {}", e);
    }

    // Load configuration
    let config = Config::from_env()?;
    let database_url = config
        .database_url
        .clone()
        .ok_or(ConfigError::MissingEnvVar("TRELLIS_DATABASE_URL"))?;

    info!(
        session_strategy = %config.session_strategy,
        batch_strategy = %config.batch_strategy,
        namespace = %config.namespace,
        "Starting Trellis Orchestrator"
    );

    // Connect to database
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await?;

    info!("Connected to database");

    migrations::run(&pool).await?;

    info!("Database schema verified");

    let persistence = Arc::new(PostgresPersistence::new(pool));

    let mut builder = OrchestratorRuntime::builder()
        .persistence(persistence)
        .config(config.clone());

    if config.session_strategy == ExecutionStrategy::Orchestrator
        || config.batch_strategy == ExecutionStrategy::Orchestrator
    {
        let orchestrator = Arc::new(KubectlOrchestrator::from_env());
        info!(
            orchestrator_type = orchestrator.orchestrator_type(),
            "Orchestrator initialized"
        );
        builder = builder.orchestrator(orchestrator);
    }

    let runtime = builder.build()?.start().await?;

    info!("Reconcile daemon ready");

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received");

    // Graceful shutdown
    runtime.shutdown().await?;

    info!("Trellis Orchestrator shut down");

    Ok(())
}
