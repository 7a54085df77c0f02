// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator trait definitions.
//!
//! Defines the abstract interface to the container orchestrator and the
//! pod status shapes it reports.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;

/// Errors from orchestrator operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum OrchestratorError {
    /// The named resource does not exist.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The orchestrator rejected or failed a request.
    #[error("Request failed: {0}")]
    RequestFailed(String),

    /// The orchestrator response could not be interpreted.
    #[error("Unexpected response: {0}")]
    InvalidResponse(String),

    /// The orchestrator is not reachable.
    #[error("Orchestrator unavailable: {0}")]
    Unavailable(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for orchestrator operations.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Kinds of resources the allocation manager creates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    /// A pod running the worker image.
    Pod,
    /// A stable network address in front of a session pod.
    Service,
}

impl ResourceKind {
    /// Resource type name as the orchestrator spells it.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Pod => "pod",
            ResourceKind::Service => "service",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A resource to create.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// Resource kind.
    pub kind: ResourceKind,
    /// Resource name, unique within the namespace.
    pub name: String,
    /// Target namespace.
    pub namespace: String,
    /// Full manifest in orchestrator JSON form.
    pub manifest: Value,
}

/// Pod lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    /// Accepted, containers not yet running.
    Pending,
    /// Bound to a node with at least one container running.
    Running,
    /// All containers terminated successfully.
    Succeeded,
    /// All containers terminated, at least one in failure.
    Failed,
    /// State could not be obtained.
    #[serde(other)]
    Unknown,
}

/// Details of a waiting or terminated container state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDetail {
    /// Machine-readable reason (e.g. `OOMKilled`, `CrashLoopBackOff`).
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message.
    #[serde(default)]
    pub message: Option<String>,
    /// Exit code, for terminated states.
    #[serde(default)]
    pub exit_code: Option<i32>,
}

/// Container state: at most one of the fields is set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerState {
    /// Present while the container runs.
    #[serde(default)]
    pub running: Option<Value>,
    /// Present while the container waits to start.
    #[serde(default)]
    pub waiting: Option<StateDetail>,
    /// Present once the container exited.
    #[serde(default)]
    pub terminated: Option<StateDetail>,
}

/// Status of one container in a pod.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerStatus {
    /// Container name.
    #[serde(default)]
    pub name: String,
    /// Number of restarts so far.
    #[serde(default)]
    pub restart_count: u32,
    /// Current state.
    #[serde(default)]
    pub state: ContainerState,
    /// Previous state (populated after a restart).
    #[serde(default)]
    pub last_state: ContainerState,
}

/// Pod status as reported by the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PodState {
    /// Phase, `None` until the orchestrator reports one.
    #[serde(default)]
    pub phase: Option<PodPhase>,
    /// Pod-level reason (e.g. `Evicted`).
    #[serde(default)]
    pub reason: Option<String>,
    /// Pod-level message.
    #[serde(default)]
    pub message: Option<String>,
    /// Per-container status.
    #[serde(default)]
    pub container_statuses: Vec<ContainerStatus>,
}

impl PodState {
    /// Build a state with only a phase set.
    pub fn with_phase(phase: PodPhase) -> Self {
        Self {
            phase: Some(phase),
            ..Self::default()
        }
    }

    /// Extract the status block from a full pod object.
    pub fn from_pod_json(pod: &Value) -> Result<Self> {
        match pod.get("status") {
            Some(status) => Ok(serde_json::from_value(status.clone())?),
            None => Ok(Self::default()),
        }
    }
}

/// Point-in-time resource usage in orchestrator notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// CPU usage (e.g. `250m`).
    pub cpu: String,
    /// Memory usage (e.g. `512Mi`).
    pub memory: String,
}

/// Trait for container orchestrator clients.
///
/// Orchestrators are PURE resource APIs - they do NOT access the database.
/// Allocation rows are handled by the caller.
#[async_trait]
pub trait Orchestrator: Send + Sync {
    /// Orchestrator type identifier (e.g. "kubectl", "mock").
    fn orchestrator_type(&self) -> &'static str;

    /// Create a resource, returning its name.
    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String>;

    /// Delete a resource. Deleting a missing resource is not an error.
    async fn delete_resource(&self, kind: ResourceKind, name: &str, namespace: &str)
    -> Result<()>;

    /// Get the current pod state, `None` if the pod does not exist.
    async fn get_resource_phase(&self, name: &str, namespace: &str) -> Result<Option<PodState>>;

    /// Get the current CPU and memory usage of a pod.
    async fn get_resource_usage(&self, name: &str, namespace: &str) -> Result<ResourceUsage>;
}
