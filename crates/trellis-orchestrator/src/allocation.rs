// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Resource Allocation Manager
//!
//! Creates, polls and tears down the compute resources backing study sessions,
//! executions and reference generation. Each workload family (sessions vs batch)
//! is dispatched to a strategy selected by configuration:
//!
//! | Strategy | Resource | Initial status |
//! |----------|----------|----------------|
//! | `thread` | none (in-process) | `running` |
//! | `subprocess` | OS process, PID recorded | `running` |
//! | `orchestrator` | pod (+ service for sessions) | first polled phase |
//!
//! # Allocation Status State Machine
//!
//! ```text
//!   ┌─────────────┐  create   ┌─────────┐  scheduled  ┌─────────┐
//!   │ NOT_STARTED │──────────►│ PENDING │────────────►│ RUNNING │
//!   └─────────────┘           └────┬────┘             └────┬────┘
//!                                  │                       │
//!                    ┌─────────────┼─────────────┬─────────┤
//!                    ▼             ▼             ▼         ▼
//!             ┌──────────┐  ┌────────────┐  ┌──────────┐ ┌───────────┐
//!             │ IN_ERROR │  │ OOM_KILLED │  │ IN_ERROR │ │ COMPLETED │
//!             └──────────┘  └────────────┘  └──────────┘ └───────────┘
//! ```
//!
//! At most one active allocation should exist per (identifier, kind). When more
//! are found, the most recently created one is authoritative and the anomaly
//! is logged; the extra rows are left for an operator to inspect.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::{debug, error, info, warn};

use crate::config::{ConfigError, ExecutionStrategy, Flavor, FlavorCatalog};
use crate::error::{Error, Result};
use crate::orchestrator::{
    Orchestrator, OrchestratorError, PodPhase, PodState, ResourceKind, ResourceSpec,
};
use crate::persistence::{NewAllocation, Persistence};
use crate::process::ProcessLauncher;

/// Termination reason reported for containers killed by the OOM killer.
pub const OOM_KILLED_REASON: &str = "OOMKilled";

/// Workload kinds that lease compute resources.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationKind {
    /// Interactive study session; identifier is the study ID.
    StudySession,
    /// Batch execution; identifier is the execution run ID.
    Execution,
    /// Reference data generation; identifier is the generation ID.
    ReferenceGeneration,
}

impl AllocationKind {
    /// Get the kind string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationKind::StudySession => "study_session",
            AllocationKind::Execution => "execution",
            AllocationKind::ReferenceGeneration => "reference_generation",
        }
    }

    /// Whether this is an interactive session (as opposed to a batch workload).
    pub fn is_session(&self) -> bool {
        matches!(self, AllocationKind::StudySession)
    }

    /// Prefix of orchestrator resource names for this kind.
    pub fn name_prefix(&self) -> &'static str {
        match self {
            AllocationKind::StudySession => "study-session",
            AllocationKind::Execution => "study-execution",
            AllocationKind::ReferenceGeneration => "reference-generation",
        }
    }
}

impl fmt::Display for AllocationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "study_session" => Ok(AllocationKind::StudySession),
            "execution" => Ok(AllocationKind::Execution),
            "reference_generation" => Ok(AllocationKind::ReferenceGeneration),
            other => Err(Error::Other(format!("Unknown allocation kind: {other}"))),
        }
    }
}

/// Normalized allocation status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationStatus {
    /// Row written, resource not requested yet.
    NotStarted,
    /// Resource requested, not running yet.
    Pending,
    /// Resource is running.
    Running,
    /// Workload finished successfully.
    Completed,
    /// Workload or resource failed.
    InError,
    /// Container was killed for exceeding its memory limit.
    OomKilled,
}

impl AllocationStatus {
    /// Get the status string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationStatus::NotStarted => "not_started",
            AllocationStatus::Pending => "pending",
            AllocationStatus::Running => "running",
            AllocationStatus::Completed => "completed",
            AllocationStatus::InError => "in_error",
            AllocationStatus::OomKilled => "oom_killed",
        }
    }

    /// Check if this is a terminal status
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            AllocationStatus::Completed | AllocationStatus::InError | AllocationStatus::OomKilled
        )
    }

    /// Check if this status means the workload failed
    pub fn is_failure(&self) -> bool {
        matches!(self, AllocationStatus::InError | AllocationStatus::OomKilled)
    }
}

impl fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "not_started" => Ok(AllocationStatus::NotStarted),
            "pending" => Ok(AllocationStatus::Pending),
            "running" => Ok(AllocationStatus::Running),
            "completed" => Ok(AllocationStatus::Completed),
            "in_error" => Ok(AllocationStatus::InError),
            "oom_killed" => Ok(AllocationStatus::OomKilled),
            other => Err(Error::Other(format!("Unknown allocation status: {other}"))),
        }
    }
}

/// One compute-resource lease.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodAllocation {
    /// Row ID.
    pub id: i64,
    /// Study, execution or reference-generation ID depending on `kind`.
    pub identifier: i64,
    /// Workload kind.
    pub kind: AllocationKind,
    /// Flavor name actually used.
    pub flavor: String,
    /// Strategy backing this allocation.
    pub strategy: ExecutionStrategy,
    /// Orchestrator resource name.
    pub pod_name: String,
    /// Orchestrator namespace.
    pub namespace: String,
    /// Normalized status.
    pub status: AllocationStatus,
    /// Status detail (failure reason, waiting reason).
    pub message: Option<String>,
    /// Worker PID for the subprocess strategy.
    pub pid: Option<i32>,
    /// When the allocation was created.
    pub created_at: DateTime<Utc>,
}

/// Allocation manager settings.
#[derive(Debug, Clone)]
pub struct AllocationConfig {
    /// Strategy for study sessions.
    pub session_strategy: ExecutionStrategy,
    /// Strategy for executions and reference generation.
    pub batch_strategy: ExecutionStrategy,
    /// Flavor catalog.
    pub flavors: FlavorCatalog,
    /// Namespace for orchestrator resources.
    pub namespace: String,
    /// Worker container image.
    pub worker_image: String,
    /// Worker command for the subprocess strategy.
    pub subprocess_command: Vec<String>,
    /// Port exposed by session pods and their service.
    pub session_port: u16,
    /// Maximum wait for a new pod to report a phase.
    pub phase_wait_timeout: Duration,
    /// Interval between phase polls while waiting.
    pub phase_poll_interval: Duration,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            session_strategy: ExecutionStrategy::Thread,
            batch_strategy: ExecutionStrategy::Thread,
            flavors: FlavorCatalog::default(),
            namespace: "default".to_string(),
            worker_image: "trellis-worker:latest".to_string(),
            subprocess_command: vec!["trellis-worker".to_string()],
            session_port: 8000,
            phase_wait_timeout: Duration::from_secs(600),
            phase_poll_interval: Duration::from_secs(1),
        }
    }
}

impl AllocationConfig {
    /// Strategy used for a workload kind.
    pub fn strategy_for(&self, kind: AllocationKind) -> ExecutionStrategy {
        if kind.is_session() {
            self.session_strategy
        } else {
            self.batch_strategy
        }
    }

    fn uses_orchestrator(&self) -> bool {
        self.session_strategy == ExecutionStrategy::Orchestrator
            || self.batch_strategy == ExecutionStrategy::Orchestrator
    }
}

/// Outcome of one reconcile sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    /// Allocations polled.
    pub checked: usize,
    /// Allocations whose status changed.
    pub changed: usize,
    /// Allocations that could not be refreshed.
    pub failed: usize,
}

/// Build the orchestrator resource name for an allocation.
///
/// Sessions get a stable name so repeated allocation for the same study maps
/// to the same resource; batch workloads get a random suffix.
pub fn resource_name(kind: AllocationKind, identifier: i64) -> String {
    if kind.is_session() {
        format!("{}-{}", kind.name_prefix(), identifier)
    } else {
        let suffix = uuid::Uuid::new_v4().simple().to_string();
        format!("{}-{}-{}", kind.name_prefix(), identifier, &suffix[..8])
    }
}

/// Map an orchestrator pod state to the normalized allocation status.
///
/// OOM kills win over everything else. A container that restarted after
/// terminating is in error even while the pod phase reads `Running`.
pub fn classify_pod(state: &PodState) -> (AllocationStatus, Option<String>) {
    for container in &state.container_statuses {
        let oom = [&container.last_state, &container.state]
            .iter()
            .filter_map(|s| s.terminated.as_ref())
            .any(|t| t.reason.as_deref() == Some(OOM_KILLED_REASON));
        if oom {
            return (
                AllocationStatus::OomKilled,
                Some(format!("container `{}` was OOMKilled", container.name)),
            );
        }
    }

    for container in &state.container_statuses {
        if container.restart_count > 0
            && let Some(terminated) = &container.last_state.terminated
        {
            let reason = terminated.reason.as_deref().unwrap_or("Error");
            let mut message = format!(
                "container `{}` restarted {} time(s) after terminating: {}",
                container.name, container.restart_count, reason
            );
            if let Some(detail) = &terminated.message {
                message.push_str(&format!(" ({detail})"));
            }
            return (AllocationStatus::InError, Some(message));
        }
    }

    match state.phase {
        None => (AllocationStatus::Pending, None),
        Some(PodPhase::Pending) => {
            let waiting = state
                .container_statuses
                .iter()
                .filter_map(|c| c.state.waiting.as_ref())
                .find_map(|w| w.reason.clone());
            (AllocationStatus::Pending, waiting.or(state.reason.clone()))
        }
        Some(PodPhase::Running) => (AllocationStatus::Running, None),
        Some(PodPhase::Succeeded) => (AllocationStatus::Completed, None),
        Some(PodPhase::Failed) => {
            let terminated = state
                .container_statuses
                .iter()
                .filter_map(|c| c.state.terminated.as_ref())
                .find_map(|t| t.reason.clone());
            let reason = state
                .reason
                .clone()
                .or(terminated)
                .or(state.message.clone())
                .unwrap_or_else(|| "pod failed".to_string());
            (AllocationStatus::InError, Some(reason))
        }
        Some(PodPhase::Unknown) => (
            AllocationStatus::InError,
            Some(
                state
                    .message
                    .clone()
                    .unwrap_or_else(|| "pod state unknown".to_string()),
            ),
        ),
    }
}

fn labels(kind: AllocationKind, identifier: i64, name: &str) -> Value {
    json!({
        "app.kubernetes.io/managed-by": "trellis",
        "trellis/kind": kind.as_str(),
        "trellis/identifier": identifier.to_string(),
        "trellis/pod-name": name,
    })
}

/// Build the pod manifest for an allocation.
pub fn pod_manifest(
    allocation: &PodAllocation,
    flavor: &Flavor,
    config: &AllocationConfig,
) -> Value {
    let mut container = json!({
        "name": "worker",
        "image": config.worker_image,
        "env": [
            {"name": "TRELLIS_ALLOCATION_KIND", "value": allocation.kind.as_str()},
            {"name": "TRELLIS_IDENTIFIER", "value": allocation.identifier.to_string()},
            {"name": "TRELLIS_ALLOCATION_ID", "value": allocation.id.to_string()},
        ],
        "resources": {
            "requests": {"memory": flavor.requests.memory, "cpu": flavor.requests.cpu},
            "limits": {"memory": flavor.limits.memory, "cpu": flavor.limits.cpu},
        },
    });
    if allocation.kind.is_session() {
        container["ports"] = json!([{"containerPort": config.session_port}]);
    }

    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": {
            "name": allocation.pod_name,
            "namespace": allocation.namespace,
            "labels": labels(allocation.kind, allocation.identifier, &allocation.pod_name),
        },
        "spec": {
            "restartPolicy": if allocation.kind.is_session() { "Always" } else { "Never" },
            "containers": [container],
        },
    })
}

/// Build the service manifest that gives a session pod a stable address.
pub fn service_manifest(allocation: &PodAllocation, config: &AllocationConfig) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": allocation.pod_name,
            "namespace": allocation.namespace,
            "labels": labels(allocation.kind, allocation.identifier, &allocation.pod_name),
        },
        "spec": {
            "selector": {"trellis/pod-name": allocation.pod_name},
            "ports": [{"port": config.session_port, "targetPort": config.session_port}],
        },
    })
}

/// Creates, polls and deletes compute allocations.
pub struct AllocationManager {
    persistence: Arc<dyn Persistence>,
    orchestrator: Option<Arc<dyn Orchestrator>>,
    launcher: ProcessLauncher,
    config: AllocationConfig,
}

impl AllocationManager {
    /// Create a new allocation manager.
    ///
    /// Fails if a strategy is `orchestrator` but no orchestrator client is given.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        orchestrator: Option<Arc<dyn Orchestrator>>,
        config: AllocationConfig,
    ) -> Result<Self> {
        if config.uses_orchestrator() && orchestrator.is_none() {
            return Err(ConfigError::MissingOrchestrator.into());
        }
        let launcher = ProcessLauncher::new(config.subprocess_command.clone());
        Ok(Self {
            persistence,
            orchestrator,
            launcher,
            config,
        })
    }

    /// Manager settings.
    pub fn config(&self) -> &AllocationConfig {
        &self.config
    }

    /// Orchestrator client, if one is configured.
    pub fn orchestrator(&self) -> Option<&Arc<dyn Orchestrator>> {
        self.orchestrator.as_ref()
    }

    fn require_orchestrator(&self) -> Result<&Arc<dyn Orchestrator>> {
        self.orchestrator
            .as_ref()
            .ok_or_else(|| ConfigError::MissingOrchestrator.into())
    }

    /// Resolve a requested flavor name against the catalog.
    ///
    /// Unknown names fall back to the first flavor of the family. With an empty
    /// family (no orchestrator in use) the requested name is kept as a label.
    fn resolve_flavor(&self, kind: AllocationKind, requested: &str) -> String {
        match self.config.flavors.select(kind, requested) {
            Some((flavor, true)) => {
                warn!(
                    requested = %requested,
                    fallback = %flavor.name,
                    kind = %kind,
                    "Unknown flavor, falling back to first configured flavor"
                );
                flavor.name.clone()
            }
            Some((flavor, false)) => flavor.name.clone(),
            None => requested.to_string(),
        }
    }

    /// Allocate a compute resource for a workload.
    ///
    /// For sessions, an existing active allocation for the same study is returned
    /// instead of creating a second one. For the orchestrator strategy this waits
    /// (up to `phase_wait_timeout`) until the pod reports a phase.
    pub async fn allocate(
        &self,
        identifier: i64,
        kind: AllocationKind,
        flavor: &str,
    ) -> Result<PodAllocation> {
        if kind.is_session()
            && let Some(existing) = self.find_active(identifier, kind).await?
        {
            info!(
                allocation_id = existing.id,
                identifier = identifier,
                pod_name = %existing.pod_name,
                "Reusing active session allocation"
            );
            return Ok(existing);
        }
        if kind.is_session() {
            self.clear_ended_sessions(identifier, kind).await?;
        }

        let strategy = self.config.strategy_for(kind);
        let new = NewAllocation {
            identifier,
            kind,
            flavor: self.resolve_flavor(kind, flavor),
            strategy,
            pod_name: resource_name(kind, identifier),
            namespace: self.config.namespace.clone(),
            status: AllocationStatus::NotStarted,
        };
        let mut allocation = self.persistence.insert_allocation(&new).await?;

        info!(
            allocation_id = allocation.id,
            identifier = identifier,
            kind = %kind,
            strategy = %strategy,
            flavor = %allocation.flavor,
            pod_name = %allocation.pod_name,
            "Allocating compute resource"
        );

        match strategy {
            ExecutionStrategy::Thread => {
                self.set_status(&mut allocation, AllocationStatus::Running, None)
                    .await?;
            }
            ExecutionStrategy::Subprocess => {
                let env = [
                    ("TRELLIS_ALLOCATION_KIND", kind.as_str().to_string()),
                    ("TRELLIS_IDENTIFIER", identifier.to_string()),
                    ("TRELLIS_ALLOCATION_ID", allocation.id.to_string()),
                ];
                let pid = match self.launcher.spawn(&env) {
                    Ok(pid) => pid as i32,
                    Err(e) => {
                        return Err(self
                            .fail(&allocation, format!("failed to spawn worker: {e}"))
                            .await);
                    }
                };
                self.persistence
                    .update_allocation_pid(allocation.id, pid)
                    .await?;
                allocation.pid = Some(pid);
                self.set_status(&mut allocation, AllocationStatus::Running, None)
                    .await?;
            }
            ExecutionStrategy::Orchestrator => {
                self.start_pod(&mut allocation).await?;
            }
        }

        Ok(allocation)
    }

    /// Remove ended session allocations and their resources.
    ///
    /// Session resources have a stable name, so a crashed or finished pod must
    /// be gone before a new one is created under the same name.
    async fn clear_ended_sessions(&self, identifier: i64, kind: AllocationKind) -> Result<()> {
        for ended in self
            .persistence
            .list_terminal_allocations(identifier, kind)
            .await?
        {
            info!(
                allocation_id = ended.id,
                identifier = identifier,
                status = %ended.status,
                pod_name = %ended.pod_name,
                "Removing ended session allocation before reallocating"
            );
            self.delete(&ended, true).await?;
        }
        Ok(())
    }

    async fn start_pod(&self, allocation: &mut PodAllocation) -> Result<()> {
        let orchestrator = self.require_orchestrator()?.clone();

        let Some((flavor, _)) = self
            .config
            .flavors
            .select(allocation.kind, &allocation.flavor)
        else {
            return Err(self
                .fail(allocation, "no flavors configured".to_string())
                .await);
        };

        let pod = ResourceSpec {
            kind: ResourceKind::Pod,
            name: allocation.pod_name.clone(),
            namespace: allocation.namespace.clone(),
            manifest: pod_manifest(allocation, flavor, &self.config),
        };
        if let Err(e) = orchestrator.create_resource(&pod).await {
            return Err(self
                .fail(allocation, format!("failed to create pod: {e}"))
                .await);
        }

        if allocation.kind.is_session() {
            let service = ResourceSpec {
                kind: ResourceKind::Service,
                name: allocation.pod_name.clone(),
                namespace: allocation.namespace.clone(),
                manifest: service_manifest(allocation, &self.config),
            };
            if let Err(e) = orchestrator.create_resource(&service).await {
                return Err(self
                    .fail(allocation, format!("failed to create service: {e}"))
                    .await);
            }
        }

        self.set_status(allocation, AllocationStatus::Pending, None)
            .await?;

        let state = match self.wait_for_phase(orchestrator.as_ref(), allocation).await {
            Some(state) => state,
            None => {
                return Err(self
                    .fail(
                        allocation,
                        format!(
                            "pod did not report a phase within {}s",
                            self.config.phase_wait_timeout.as_secs()
                        ),
                    )
                    .await);
            }
        };

        let (status, reason) = classify_pod(&state);
        self.set_status(allocation, status, reason).await?;

        info!(
            allocation_id = allocation.id,
            pod_name = %allocation.pod_name,
            status = %allocation.status,
            "Pod created"
        );

        Ok(())
    }

    /// Poll until the pod reports any phase, or the timeout elapses.
    async fn wait_for_phase(
        &self,
        orchestrator: &dyn Orchestrator,
        allocation: &PodAllocation,
    ) -> Option<PodState> {
        let deadline = tokio::time::Instant::now() + self.config.phase_wait_timeout;
        loop {
            match orchestrator
                .get_resource_phase(&allocation.pod_name, &allocation.namespace)
                .await
            {
                Ok(Some(state)) if state.phase.is_some() => return Some(state),
                Ok(_) => {
                    debug!(pod_name = %allocation.pod_name, "Pod has no phase yet");
                }
                Err(e) => {
                    warn!(
                        pod_name = %allocation.pod_name,
                        error = %e,
                        "Failed to poll pod phase"
                    );
                }
            }

            if tokio::time::Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.config.phase_poll_interval).await;
        }
    }

    async fn set_status(
        &self,
        allocation: &mut PodAllocation,
        status: AllocationStatus,
        message: Option<String>,
    ) -> Result<()> {
        self.persistence
            .update_allocation_status(allocation.id, status, message.as_deref())
            .await?;
        allocation.status = status;
        allocation.message = message;
        Ok(())
    }

    /// Record an allocation failure and build the error to return.
    async fn fail(&self, allocation: &PodAllocation, message: String) -> Error {
        error!(
            allocation_id = allocation.id,
            pod_name = %allocation.pod_name,
            error = %message,
            "Allocation failed"
        );
        if let Err(e) = self
            .persistence
            .update_allocation_status(allocation.id, AllocationStatus::InError, Some(&message))
            .await
        {
            error!(allocation_id = allocation.id, error = %e, "Failed to record allocation failure");
        }
        Error::Allocation {
            allocation_id: Some(allocation.id),
            message,
        }
    }

    /// Find the authoritative active allocation for (identifier, kind).
    pub async fn find_active(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Option<PodAllocation>> {
        let mut active = self
            .persistence
            .list_active_allocations(identifier, kind)
            .await?;

        if active.len() > 1 {
            let ids: Vec<i64> = active.iter().map(|a| a.id).collect();
            warn!(
                identifier = identifier,
                kind = %kind,
                allocation_ids = ?ids,
                "Multiple active allocations found, using the most recent one"
            );
        }

        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(active.into_iter().next())
    }

    /// Get the current status of an allocation.
    ///
    /// Only orchestrator allocations are polled. For the other strategies an active
    /// row reports `running` and a terminal row reports its stored status.
    pub async fn get_status(
        &self,
        allocation: &PodAllocation,
    ) -> Result<(AllocationStatus, Option<String>)> {
        if allocation.strategy != ExecutionStrategy::Orchestrator {
            if allocation.status.is_terminal() {
                return Ok((allocation.status, allocation.message.clone()));
            }
            return Ok((AllocationStatus::Running, None));
        }

        let orchestrator = self.require_orchestrator()?;
        match orchestrator
            .get_resource_phase(&allocation.pod_name, &allocation.namespace)
            .await?
        {
            Some(state) => Ok(classify_pod(&state)),
            None => Ok((
                AllocationStatus::InError,
                Some("resource not found".to_string()),
            )),
        }
    }

    /// Poll an allocation and persist its status if it changed.
    pub async fn refresh_status(&self, allocation: &PodAllocation) -> Result<PodAllocation> {
        let (status, message) = self.get_status(allocation).await?;
        let mut refreshed = allocation.clone();
        if status != allocation.status || message != allocation.message {
            debug!(
                allocation_id = allocation.id,
                from = %allocation.status,
                to = %status,
                "Allocation status changed"
            );
            self.set_status(&mut refreshed, status, message).await?;
        }
        Ok(refreshed)
    }

    /// Set the final status of an allocation whose workload ended.
    pub async fn finish(
        &self,
        allocation: &PodAllocation,
        status: AllocationStatus,
        message: Option<&str>,
    ) -> Result<()> {
        self.persistence
            .update_allocation_status(allocation.id, status, message)
            .await
    }

    /// Delete an allocation.
    ///
    /// With `delete_resource`, the orchestrator pod (and the session service) is
    /// removed first. Deleting an already deleted allocation is not an error.
    pub async fn delete(&self, allocation: &PodAllocation, delete_resource: bool) -> Result<()> {
        if delete_resource && allocation.strategy == ExecutionStrategy::Orchestrator {
            let orchestrator = self.require_orchestrator()?;
            orchestrator
                .delete_resource(ResourceKind::Pod, &allocation.pod_name, &allocation.namespace)
                .await
                .or_else(ignore_not_found)?;
            if allocation.kind.is_session() {
                orchestrator
                    .delete_resource(
                        ResourceKind::Service,
                        &allocation.pod_name,
                        &allocation.namespace,
                    )
                    .await
                    .or_else(ignore_not_found)?;
            }
        }

        let existed = self.persistence.delete_allocation(allocation.id).await?;

        info!(
            allocation_id = allocation.id,
            pod_name = %allocation.pod_name,
            delete_resource = delete_resource,
            existed = existed,
            "Deleted allocation"
        );

        Ok(())
    }

    /// Refresh the status of every unfinished orchestrator allocation.
    ///
    /// Safe to run concurrently with `allocate`/`delete`: each row is read and
    /// written independently, and per-row errors do not abort the sweep.
    pub async fn reconcile_all(&self) -> Result<ReconcileSummary> {
        let allocations = self.persistence.list_unfinished_allocations().await?;
        let mut summary = ReconcileSummary::default();

        for allocation in allocations
            .iter()
            .filter(|a| a.strategy == ExecutionStrategy::Orchestrator)
        {
            summary.checked += 1;
            match self.refresh_status(allocation).await {
                Ok(refreshed) => {
                    if refreshed.status != allocation.status {
                        summary.changed += 1;
                    }
                }
                Err(e) => {
                    summary.failed += 1;
                    warn!(
                        allocation_id = allocation.id,
                        pod_name = %allocation.pod_name,
                        error = %e,
                        "Failed to refresh allocation status"
                    );
                }
            }
        }

        if summary.checked > 0 {
            debug!(
                checked = summary.checked,
                changed = summary.changed,
                failed = summary.failed,
                "Reconciled allocations"
            );
        }

        Ok(summary)
    }

    /// Delete completed batch allocations older than `max_age`, resources included.
    pub async fn collect_garbage(&self, max_age: Duration) -> Result<u64> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(max_age)
                .map_err(|e| Error::Other(format!("Invalid duration: {}", e)))?;

        let completed = self
            .persistence
            .list_completed_allocations_before(cutoff)
            .await?;

        let mut deleted = 0;
        for allocation in completed.iter().filter(|a| !a.kind.is_session()) {
            match self.delete(allocation, true).await {
                Ok(()) => deleted += 1,
                Err(e) => warn!(
                    allocation_id = allocation.id,
                    error = %e,
                    "Failed to garbage collect allocation"
                ),
            }
        }

        if deleted > 0 {
            info!(count = deleted, "Garbage collected completed allocations");
        }

        Ok(deleted)
    }
}

fn ignore_not_found(e: OrchestratorError) -> std::result::Result<(), OrchestratorError> {
    match e {
        OrchestratorError::NotFound(_) => Ok(()),
        other => Err(other),
    }
}
