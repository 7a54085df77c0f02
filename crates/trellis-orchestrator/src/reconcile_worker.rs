// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Background worker keeping allocation rows in sync with the orchestrator.
//!
//! Pods change state on their own (crash, OOM kill, eviction, completion).
//! The worker periodically polls every unfinished orchestrator allocation and
//! persists its classified status, then garbage collects completed batch
//! allocations past their retention.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{error, info};

use crate::allocation::AllocationManager;

/// Configuration for the reconcile worker.
#[derive(Debug, Clone)]
pub struct ReconcileWorkerConfig {
    /// How often to reconcile.
    pub poll_interval: Duration,
    /// Age after which completed batch allocations are deleted.
    pub retention: Duration,
}

impl Default for ReconcileWorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(10),
            retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Background worker that reconciles allocation statuses.
pub struct ReconcileWorker {
    allocations: Arc<AllocationManager>,
    config: ReconcileWorkerConfig,
    shutdown: Arc<Notify>,
}

impl ReconcileWorker {
    /// Create a new reconcile worker.
    pub fn new(allocations: Arc<AllocationManager>, config: ReconcileWorkerConfig) -> Self {
        Self {
            allocations,
            config,
            shutdown: Arc::new(Notify::new()),
        }
    }

    /// Get a handle that can be used to signal shutdown.
    pub fn shutdown_handle(&self) -> Arc<Notify> {
        self.shutdown.clone()
    }

    /// Run the reconcile loop until the shutdown signal is received.
    pub async fn run(&self) {
        info!(
            poll_interval_secs = self.config.poll_interval.as_secs(),
            retention_secs = self.config.retention.as_secs(),
            "Reconcile worker started"
        );

        loop {
            tokio::select! {
                biased;

                _ = self.shutdown.notified() => {
                    info!("Reconcile worker received shutdown signal");
                    break;
                }

                _ = tokio::time::sleep(self.config.poll_interval) => {
                    self.tick().await;
                }
            }
        }

        info!("Reconcile worker stopped");
    }

    /// One reconcile pass. Errors are logged.
    pub async fn tick(&self) {
        if let Err(e) = self.allocations.reconcile_all().await {
            error!(error = %e, "Failed to reconcile allocations");
        }
        if let Err(e) = self.allocations.collect_garbage(self.config.retention).await {
            error!(error = %e, "Failed to garbage collect allocations");
        }
    }
}
