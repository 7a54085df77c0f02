// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Execution Supervisor
//!
//! Drives one execution run of a study from submission to a terminal state:
//! allocate a batch resource, run the computation with the status pipeline and
//! metrics sampler attached, then reconcile the run, the study timestamp and
//! the allocation.
//!
//! # Run Status State Machine
//!
//! ```text
//!   ┌─────────┐  start  ┌─────────┐  engine ok    ┌──────────┐
//!   │ PENDING │────────►│ RUNNING │──────────────►│ FINISHED │
//!   └────┬────┘         └────┬────┘               └──────────┘
//!        │                   │ engine error       ┌──────────┐
//!        │ allocation        ├───────────────────►│  FAILED  │
//!        │ failure ─────────────────────────────► └──────────┘
//!        │                   │ stop()             ┌──────────┐
//!        └───────────────────┴───────────────────►│ STOPPED  │
//!                                                 └──────────┘
//! ```
//!
//! Terminal statuses are immutable: completion only applies while the run is
//! still `running`, so a completion racing a `stop` leaves `stopped`.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::allocation::{AllocationKind, AllocationManager, AllocationStatus, PodAllocation};
use crate::cache::{LoadStatus, StudyManager};
use crate::config::ExecutionStrategy;
use crate::engine::{CancelToken, EngineError, StudyEngine};
use crate::error::{Error, Result};
use crate::metrics::{
    DEFAULT_SAMPLE_INTERVAL, HostUsage, MetricsSampler, OrchestratorUsage, UsageSource,
};
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::pipeline::{PipelineConfig, StatusPipeline};
use crate::process;

/// Minimum step of the study modification timestamp when the clock did not advance.
pub const MODIFICATION_STEP: Duration = Duration::from_secs(5);

/// Execution run status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created, computation not started.
    Pending,
    /// Computation in progress.
    Running,
    /// Computation completed successfully.
    Finished,
    /// Allocation or computation failed.
    Failed,
    /// Stopped on request.
    Stopped,
    /// Never executed (superseded before it could start).
    NotExecuted,
}

impl RunStatus {
    /// Get the status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Finished => "finished",
            RunStatus::Failed => "failed",
            RunStatus::Stopped => "stopped",
            RunStatus::NotExecuted => "not_executed",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Pending | RunStatus::Running)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "finished" => Ok(RunStatus::Finished),
            "failed" => Ok(RunStatus::Failed),
            "stopped" => Ok(RunStatus::Stopped),
            "not_executed" => Ok(RunStatus::NotExecuted),
            other => Err(Error::Other(format!("Unknown run status: {other}"))),
        }
    }
}

/// One execution of a study computation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRun {
    /// Run ID.
    pub id: i64,
    /// Study being computed.
    pub study_id: i64,
    /// Current status.
    pub status: RunStatus,
    /// Failure or stop reason.
    pub message: Option<String>,
    /// Latest CPU usage sample, in cores.
    pub cpu_usage: Option<f64>,
    /// Latest memory usage sample, in MB.
    pub memory_usage: Option<f64>,
    /// When the run was created.
    pub created_at: DateTime<Utc>,
    /// When the computation started.
    pub started_at: Option<DateTime<Utc>>,
    /// When the run reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
}

/// Why an execution did not complete.
#[derive(Debug, Error)]
pub enum ExecutionError {
    /// The batch resource could not be allocated; the computation never ran.
    #[error("Run {run_id}: allocation failed: {message}")]
    Allocation {
        /// Run ID.
        run_id: i64,
        /// Allocation failure description.
        message: String,
    },

    /// The computation ran and failed.
    #[error("Run {run_id}: computation failed: {source}")]
    Computation {
        /// Run ID.
        run_id: i64,
        /// Engine error.
        #[source]
        source: EngineError,
    },

    /// The study handle carries no runnable engine.
    #[error("Study {study_id} cannot be executed while {status:?}")]
    NotRunnable {
        /// Study ID.
        study_id: i64,
        /// Load status of the handle.
        status: LoadStatus,
    },
}

/// Supervisor settings.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Status pipeline settings for each run.
    pub pipeline: PipelineConfig,
    /// Resource usage sampling interval.
    pub sample_interval: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            pipeline: PipelineConfig::default(),
            sample_interval: DEFAULT_SAMPLE_INTERVAL,
        }
    }
}

/// Compute the next study modification timestamp.
///
/// Timestamps must strictly increase so caches detect the change: if the
/// computed time is not after the previous one (clock skew, fast successive
/// runs), the previous time plus five seconds is used.
pub fn next_modification_timestamp(
    previous: Option<DateTime<Utc>>,
    computed: DateTime<Utc>,
) -> DateTime<Utc> {
    match previous {
        Some(previous) if computed <= previous => {
            let next = previous + chrono::Duration::seconds(MODIFICATION_STEP.as_secs() as i64);
            warn!(
                previous = %previous,
                computed = %computed,
                next = %next,
                "Modification timestamp did not advance, stepping forward"
            );
            next
        }
        _ => computed,
    }
}

/// Runs study computations and tracks them to a terminal status.
pub struct ExecutionSupervisor {
    persistence: Arc<dyn Persistence>,
    allocations: Arc<AllocationManager>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    config: SupervisorConfig,
    cancel_tokens: DashMap<i64, CancelToken>,
}

impl ExecutionSupervisor {
    /// Create a new supervisor.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        allocations: Arc<AllocationManager>,
        orchestrator: Option<Arc<dyn Orchestrator>>,
        config: SupervisorConfig,
    ) -> Self {
        Self {
            persistence,
            allocations,
            orchestrator,
            config,
            cancel_tokens: DashMap::new(),
        }
    }

    /// Number of computations currently running in this process.
    pub fn running_count(&self) -> usize {
        self.cancel_tokens.len()
    }

    /// Submit an execution of a loaded study.
    ///
    /// Creates the run and its batch allocation. With the thread strategy the
    /// computation is started in the background; with the other strategies the
    /// allocated worker owns it. Returns the run as created.
    pub async fn submit(self: &Arc<Self>, study: Arc<StudyManager>, flavor: &str) -> Result<ExecutionRun> {
        runnable_engine(&study)?;

        let run = self.persistence.create_run(study.study_id).await?;

        info!(
            run_id = run.id,
            study_id = study.study_id,
            flavor = %flavor,
            "Submitting execution"
        );

        let allocation = match self
            .allocations
            .allocate(run.id, AllocationKind::Execution, flavor)
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                let message = e.to_string();
                error!(run_id = run.id, error = %message, "Execution allocation failed");
                if let Err(e) = self.persistence.fail_pending_run(run.id, &message).await {
                    error!(run_id = run.id, error = %e, "Failed to mark run as failed");
                }
                return Err(ExecutionError::Allocation {
                    run_id: run.id,
                    message,
                }
                .into());
            }
        };

        if allocation.strategy == ExecutionStrategy::Thread {
            let supervisor = Arc::clone(self);
            let run_id = run.id;
            tokio::spawn(async move {
                match supervisor.start(run_id, study).await {
                    Ok(status) => debug!(run_id = run_id, status = %status, "Execution ended"),
                    Err(e) => warn!(run_id = run_id, error = %e, "Execution ended with error"),
                }
            });
        }

        Ok(run)
    }

    /// Run a submitted execution to completion in this process.
    ///
    /// Returns the final stored status. A failed computation is recorded as
    /// `failed` and returned as [`ExecutionError::Computation`].
    pub async fn start(&self, run_id: i64, study: Arc<StudyManager>) -> Result<RunStatus> {
        let engine = runnable_engine(&study)?;

        let cancel: CancelToken = Arc::new(AtomicBool::new(false));
        self.cancel_tokens.insert(run_id, cancel.clone());

        let outcome = self.run_to_completion(run_id, &study, engine, cancel).await;
        self.cancel_tokens.remove(&run_id);
        outcome
    }

    async fn run_to_completion(
        &self,
        run_id: i64,
        study: &StudyManager,
        engine: Arc<dyn StudyEngine>,
        cancel: CancelToken,
    ) -> Result<RunStatus> {
        if !self.persistence.mark_run_running(run_id).await? {
            let run = self
                .persistence
                .get_run(run_id)
                .await?
                .ok_or(Error::RunNotFound(run_id))?;
            info!(
                run_id = run_id,
                status = %run.status,
                "Run is no longer pending, not starting computation"
            );
            return Ok(run.status);
        }

        let allocation = match self
            .allocations
            .find_active(run_id, AllocationKind::Execution)
            .await
        {
            Ok(allocation) => allocation,
            Err(e) => {
                warn!(
                    run_id = run_id,
                    error = %e,
                    "Failed to look up execution allocation, continuing without it"
                );
                None
            }
        };

        info!(run_id = run_id, study_id = study.study_id, "Starting computation");

        let pipeline = StatusPipeline::start(
            self.persistence.clone(),
            run_id,
            self.config.pipeline.clone(),
        );
        let sub_units = engine.sub_units();
        for sub_unit in &sub_units {
            engine.attach_observer(sub_unit, pipeline.clone());
        }

        let sampler = self
            .usage_source(allocation.as_ref())
            .await
            .map(|source| {
                MetricsSampler::start(
                    source,
                    self.persistence.clone(),
                    run_id,
                    self.config.sample_interval,
                )
            });

        let result = {
            let engine = engine.clone();
            tokio::task::spawn_blocking(move || engine.run(&cancel))
                .await
                .map_err(|e| EngineError::Join(e.to_string()))
                .and_then(|r| r)
        };

        for sub_unit in &sub_units {
            engine.detach_observer(sub_unit);
        }
        pipeline.stop().await;
        if let Some(sampler) = sampler {
            sampler.stop().await;
        }

        if !matches!(result, Err(EngineError::Cancelled)) {
            let engine = engine.clone();
            match tokio::task::spawn_blocking(move || engine.persist_artifacts()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(run_id = run_id, error = %e, "Failed to persist artifacts"),
                Err(e) => warn!(run_id = run_id, error = %e, "Artifact persistence panicked"),
            }
        }

        if let Err(e) = self.touch_modification(study.study_id).await {
            warn!(
                run_id = run_id,
                study_id = study.study_id,
                error = %e,
                "Failed to update study modification timestamp"
            );
        }

        let (status, failure) = match result {
            Ok(()) => (RunStatus::Finished, None),
            Err(EngineError::Cancelled) => (RunStatus::Stopped, None),
            Err(e) => (RunStatus::Failed, Some(e)),
        };
        let message = failure.as_ref().map(|e| e.to_string());

        let final_status = match self
            .persistence
            .complete_run_if_running(run_id, status, message.as_deref())
            .await
        {
            Ok(true) => status,
            Ok(false) => {
                let stored = match self.persistence.get_run(run_id).await {
                    Ok(run) => run.map(|r| r.status).unwrap_or(status),
                    Err(e) => {
                        warn!(run_id = run_id, error = %e, "Failed to read back run status");
                        status
                    }
                };
                info!(
                    run_id = run_id,
                    computed = %status,
                    stored = %stored,
                    "Run reached a terminal status first, keeping it"
                );
                stored
            }
            Err(e) => {
                error!(
                    run_id = run_id,
                    status = %status,
                    error = %e,
                    "Failed to record terminal run status"
                );
                status
            }
        };

        if let Some(allocation) = allocation {
            let allocation_status = match final_status {
                RunStatus::Failed => AllocationStatus::InError,
                _ => AllocationStatus::Completed,
            };
            if let Err(e) = self
                .allocations
                .finish(&allocation, allocation_status, message.as_deref())
                .await
            {
                warn!(
                    run_id = run_id,
                    allocation_id = allocation.id,
                    error = %e,
                    "Failed to finish execution allocation"
                );
            }
        }

        info!(run_id = run_id, status = %final_status, "Computation ended");

        match failure {
            Some(source) if final_status == RunStatus::Failed => {
                Err(ExecutionError::Computation { run_id, source }.into())
            }
            _ => Ok(final_status),
        }
    }

    async fn usage_source(
        &self,
        allocation: Option<&PodAllocation>,
    ) -> Option<Arc<dyn UsageSource>> {
        match (allocation, &self.orchestrator) {
            (Some(allocation), Some(orchestrator))
                if allocation.strategy == ExecutionStrategy::Orchestrator =>
            {
                Some(Arc::new(OrchestratorUsage::new(
                    orchestrator.clone(),
                    &allocation.pod_name,
                    &allocation.namespace,
                )))
            }
            _ => match HostUsage::detect().await {
                Ok(source) => Some(Arc::new(source)),
                Err(e) => {
                    debug!(error = %e, "Host usage unavailable, not sampling");
                    None
                }
            },
        }
    }

    async fn touch_modification(&self, study_id: i64) -> Result<()> {
        let previous = self.persistence.get_study_modified_at(study_id).await?;
        let next = next_modification_timestamp(previous, Utc::now());
        self.persistence.set_study_modified_at(study_id, next).await
    }

    /// Stop a run.
    ///
    /// Returns false if the run was already terminal. The stored status becomes
    /// `stopped` before any resource is touched, so a computation finishing
    /// concurrently cannot overwrite it.
    pub async fn stop(&self, run_id: i64) -> Result<bool> {
        if !self
            .persistence
            .stop_run_if_active(run_id, Some("stopped on request"))
            .await?
        {
            if self.persistence.get_run(run_id).await?.is_none() {
                return Err(Error::RunNotFound(run_id));
            }
            debug!(run_id = run_id, "Run already terminal, nothing to stop");
            return Ok(false);
        }

        if let Some(token) = self.cancel_tokens.get(&run_id) {
            token.store(true, Ordering::SeqCst);
        }

        if let Some(allocation) = self
            .allocations
            .find_active(run_id, AllocationKind::Execution)
            .await?
        {
            match allocation.strategy {
                ExecutionStrategy::Orchestrator => {
                    self.allocations.delete(&allocation, true).await?;
                }
                ExecutionStrategy::Subprocess => {
                    if let Some(pid) = allocation.pid {
                        match process::terminate(pid) {
                            Ok(true) => info!(run_id = run_id, pid = pid, "Sent SIGTERM to worker"),
                            Ok(false) => debug!(run_id = run_id, pid = pid, "Worker already exited"),
                            Err(e) => warn!(run_id = run_id, pid = pid, error = %e, "Failed to signal worker"),
                        }
                    }
                    self.allocations.delete(&allocation, false).await?;
                }
                ExecutionStrategy::Thread => {
                    self.allocations.delete(&allocation, false).await?;
                }
            }
        }

        info!(run_id = run_id, "Run stopped");
        Ok(true)
    }

    /// Tear down the session allocation of a study.
    ///
    /// The backing resource is only deleted if it was ever requested.
    pub async fn stop_session(&self, study_id: i64) -> Result<()> {
        let Some(allocation) = self
            .allocations
            .find_active(study_id, AllocationKind::StudySession)
            .await?
        else {
            debug!(study_id = study_id, "No active session allocation");
            return Ok(());
        };

        let delete_resource = allocation.status != AllocationStatus::NotStarted;
        self.allocations.delete(&allocation, delete_resource).await?;

        info!(study_id = study_id, "Session stopped");
        Ok(())
    }
}

fn runnable_engine(study: &StudyManager) -> Result<Arc<dyn StudyEngine>> {
    match (&study.engine, study.status) {
        (Some(engine), LoadStatus::Loaded) => Ok(engine.clone()),
        (_, status) => Err(ExecutionError::NotRunnable {
            study_id: study.study_id,
            status,
        }
        .into()),
    }
}
