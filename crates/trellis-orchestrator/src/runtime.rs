// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Embeddable runtime for trellis-orchestrator.
//!
//! [`OrchestratorRuntime`] wires the study cache, allocation manager and
//! execution supervisor together and runs the reconcile worker in the
//! background. Request handlers of the embedding application use the exposed
//! components directly.
//!
//! # Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use trellis_orchestrator::config::Config;
//! use trellis_orchestrator::persistence::PostgresPersistence;
//! use trellis_orchestrator::runtime::OrchestratorRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let pool = sqlx::PgPool::connect("postgres://...").await?;
//!     let runtime = OrchestratorRuntime::builder()
//!         .persistence(Arc::new(PostgresPersistence::new(pool)))
//!         .loader(Arc::new(MyLoader::new()))
//!         .config(Config::from_env()?)
//!         .build()?
//!         .start()
//!         .await?;
//!
//!     let study = runtime.cache().unwrap().get(42, true).await?;
//!     runtime.supervisor().submit(study, "small").await?;
//!
//!     runtime.shutdown().await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::allocation::AllocationManager;
use crate::cache::StudyManagerCache;
use crate::config::Config;
use crate::engine::StudyLoader;
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::reconcile_worker::{ReconcileWorker, ReconcileWorkerConfig};
use crate::supervisor::{ExecutionSupervisor, SupervisorConfig};

/// Builder for creating an [`OrchestratorRuntime`].
#[derive(Default)]
pub struct OrchestratorRuntimeBuilder {
    persistence: Option<Arc<dyn Persistence>>,
    loader: Option<Arc<dyn StudyLoader>>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    config: Config,
    reconcile_interval: Option<Duration>,
    supervisor_config: SupervisorConfig,
}

impl OrchestratorRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the persistence backend (required).
    pub fn persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// Set the study loader.
    ///
    /// Without a loader the runtime has no study cache; only allocation
    /// management and reconciliation run.
    pub fn loader(mut self, loader: Arc<dyn StudyLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    /// Set the orchestrator client (required when a strategy is `orchestrator`).
    pub fn orchestrator(mut self, orchestrator: Arc<dyn Orchestrator>) -> Self {
        self.orchestrator = Some(orchestrator);
        self
    }

    /// Set the configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Override the reconcile interval from the configuration.
    pub fn reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = Some(interval);
        self
    }

    /// Set supervisor settings (flush window, sampling interval).
    pub fn supervisor_config(mut self, config: SupervisorConfig) -> Self {
        self.supervisor_config = config;
        self
    }

    /// Build the runtime components.
    ///
    /// Returns an error if required fields are missing or the configuration is
    /// inconsistent (orchestrator strategy without a client).
    pub fn build(self) -> Result<OrchestratorRuntimeConfig> {
        let persistence = self
            .persistence
            .ok_or_else(|| anyhow::anyhow!("persistence is required"))?;

        let allocations = Arc::new(AllocationManager::new(
            persistence.clone(),
            self.orchestrator.clone(),
            self.config.allocation_config(),
        )?);

        let cache = self.loader.map(|loader| {
            Arc::new(StudyManagerCache::new(
                persistence.clone(),
                loader,
                self.config.cache_config(),
            ))
        });

        let supervisor = Arc::new(ExecutionSupervisor::new(
            persistence,
            allocations.clone(),
            self.orchestrator,
            self.supervisor_config,
        ));

        Ok(OrchestratorRuntimeConfig {
            allocations,
            cache,
            supervisor,
            reconcile: ReconcileWorkerConfig {
                poll_interval: self
                    .reconcile_interval
                    .unwrap_or(self.config.reconcile_interval),
                retention: self.config.allocation_retention,
            },
        })
    }
}

/// Built, not yet started, runtime.
pub struct OrchestratorRuntimeConfig {
    allocations: Arc<AllocationManager>,
    cache: Option<Arc<StudyManagerCache>>,
    supervisor: Arc<ExecutionSupervisor>,
    reconcile: ReconcileWorkerConfig,
}

impl OrchestratorRuntimeConfig {
    /// Start the runtime, spawning the reconcile worker.
    pub async fn start(self) -> Result<OrchestratorRuntime> {
        let worker = ReconcileWorker::new(self.allocations.clone(), self.reconcile.clone());
        let reconcile_shutdown = worker.shutdown_handle();
        let reconcile_handle = tokio::spawn(async move {
            worker.run().await;
        });

        info!(
            reconcile_interval_secs = self.reconcile.poll_interval.as_secs(),
            cache = self.cache.is_some(),
            "OrchestratorRuntime started"
        );

        Ok(OrchestratorRuntime {
            allocations: self.allocations,
            cache: self.cache,
            supervisor: self.supervisor,
            reconcile_handle,
            reconcile_shutdown,
        })
    }
}

/// A running orchestration core.
///
/// Call [`shutdown`](Self::shutdown) for graceful termination.
pub struct OrchestratorRuntime {
    allocations: Arc<AllocationManager>,
    cache: Option<Arc<StudyManagerCache>>,
    supervisor: Arc<ExecutionSupervisor>,
    reconcile_handle: JoinHandle<()>,
    reconcile_shutdown: Arc<Notify>,
}

impl OrchestratorRuntime {
    /// Create a new builder for configuring the runtime.
    pub fn builder() -> OrchestratorRuntimeBuilder {
        OrchestratorRuntimeBuilder::new()
    }

    /// Study manager cache, if a loader was configured.
    pub fn cache(&self) -> Option<&Arc<StudyManagerCache>> {
        self.cache.as_ref()
    }

    /// Allocation manager.
    pub fn allocations(&self) -> &Arc<AllocationManager> {
        &self.allocations
    }

    /// Execution supervisor.
    pub fn supervisor(&self) -> &Arc<ExecutionSupervisor> {
        &self.supervisor
    }

    /// Check if the runtime is still running.
    pub fn is_running(&self) -> bool {
        !self.reconcile_handle.is_finished()
    }

    /// Gracefully shut down the runtime.
    ///
    /// Stops the reconcile worker and releases every cached study.
    pub async fn shutdown(self) -> Result<()> {
        info!("OrchestratorRuntime shutting down...");

        self.reconcile_shutdown.notify_one();
        if let Err(e) = self.reconcile_handle.await {
            error!("Reconcile worker task panicked: {}", e);
        }

        if let Some(cache) = &self.cache {
            cache.clear().await;
        }

        info!("OrchestratorRuntime shutdown complete");
        Ok(())
    }
}
