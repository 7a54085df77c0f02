// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Mock orchestrator for testing.
//!
//! Keeps resources in memory and reports scripted pod states, so allocation
//! logic can be exercised without a cluster.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::Mutex;

use super::traits::*;

/// Mock resource state.
#[derive(Debug, Clone)]
struct MockResource {
    manifest: Value,
    /// Polls left before the pod reports a phase.
    unreported_polls: u32,
}

#[derive(Debug, Default)]
struct MockState {
    resources: HashMap<(ResourceKind, String, String), MockResource>,
    pod_states: HashMap<String, PodState>,
    usage: HashMap<String, ResourceUsage>,
    created: Vec<(ResourceKind, String)>,
    deleted: Vec<(ResourceKind, String)>,
}

/// Mock orchestrator for testing.
pub struct MockOrchestrator {
    state: Arc<Mutex<MockState>>,
    /// State reported for pods that have no scripted state
    pub initial_state: PodState,
    /// Number of polls a new pod answers without a phase
    pub unreported_polls: u32,
    /// If true, `create_resource` fails
    pub fail_create: bool,
    fail_usage: AtomicBool,
    usage_calls: AtomicU32,
}

impl Default for MockOrchestrator {
    fn default() -> Self {
        Self::new()
    }
}

impl MockOrchestrator {
    /// Create a mock whose pods report `Running` immediately.
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            initial_state: PodState::with_phase(PodPhase::Running),
            unreported_polls: 0,
            fail_create: false,
            fail_usage: AtomicBool::new(false),
            usage_calls: AtomicU32::new(0),
        }
    }

    /// Create a mock that rejects every resource creation.
    pub fn failing() -> Self {
        Self {
            fail_create: true,
            ..Self::new()
        }
    }

    /// Create a mock whose pods never report a phase.
    pub fn never_scheduling() -> Self {
        Self {
            unreported_polls: u32::MAX,
            ..Self::new()
        }
    }

    /// Report `state` for pods without a scripted state.
    pub fn with_initial_state(mut self, state: PodState) -> Self {
        self.initial_state = state;
        self
    }

    /// Answer the first `polls` phase queries of each new pod without a phase.
    pub fn with_unreported_polls(mut self, polls: u32) -> Self {
        self.unreported_polls = polls;
        self
    }

    /// Script the state reported for a pod.
    pub async fn set_pod_state(&self, name: &str, state: PodState) {
        let mut inner = self.state.lock().await;
        for ((kind, _, resource_name), resource) in inner.resources.iter_mut() {
            if resource_name == name && *kind == ResourceKind::Pod {
                resource.unreported_polls = 0;
            }
        }
        inner.pod_states.insert(name.to_string(), state);
    }

    /// Script the usage reported for a pod.
    pub async fn set_usage(&self, name: &str, usage: ResourceUsage) {
        self.state
            .lock()
            .await
            .usage
            .insert(name.to_string(), usage);
    }

    /// Make usage queries fail (or succeed again).
    pub fn set_usage_failing(&self, failing: bool) {
        self.fail_usage.store(failing, Ordering::SeqCst);
    }

    /// Number of usage queries served so far, failed ones included.
    pub fn usage_calls(&self) -> u32 {
        self.usage_calls.load(Ordering::SeqCst)
    }

    /// Whether a resource currently exists.
    pub async fn exists(&self, kind: ResourceKind, name: &str, namespace: &str) -> bool {
        self.state
            .lock()
            .await
            .resources
            .contains_key(&(kind, namespace.to_string(), name.to_string()))
    }

    /// Resources created so far, in order.
    pub async fn created(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().await.created.clone()
    }

    /// Resources deleted so far, in order.
    pub async fn deleted(&self) -> Vec<(ResourceKind, String)> {
        self.state.lock().await.deleted.clone()
    }

    /// Manifest submitted for a resource, if it exists.
    pub async fn manifest(&self, kind: ResourceKind, name: &str, namespace: &str) -> Option<Value> {
        self.state
            .lock()
            .await
            .resources
            .get(&(kind, namespace.to_string(), name.to_string()))
            .map(|r| r.manifest.clone())
    }
}

#[async_trait]
impl Orchestrator for MockOrchestrator {
    fn orchestrator_type(&self) -> &'static str {
        "mock"
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String> {
        if self.fail_create {
            return Err(OrchestratorError::RequestFailed(format!(
                "mock refused to create {} {}",
                spec.kind, spec.name
            )));
        }

        let mut inner = self.state.lock().await;
        inner.resources.insert(
            (spec.kind, spec.namespace.clone(), spec.name.clone()),
            MockResource {
                manifest: spec.manifest.clone(),
                unreported_polls: self.unreported_polls,
            },
        );
        inner.created.push((spec.kind, spec.name.clone()));
        Ok(spec.name.clone())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let mut inner = self.state.lock().await;
        if inner
            .resources
            .remove(&(kind, namespace.to_string(), name.to_string()))
            .is_some()
        {
            if kind == ResourceKind::Pod {
                inner.pod_states.remove(name);
            }
            inner.deleted.push((kind, name.to_string()));
        }
        Ok(())
    }

    async fn get_resource_phase(&self, name: &str, namespace: &str) -> Result<Option<PodState>> {
        let mut inner = self.state.lock().await;
        let key = (ResourceKind::Pod, namespace.to_string(), name.to_string());
        let Some(resource) = inner.resources.get_mut(&key) else {
            return Ok(None);
        };
        if resource.unreported_polls > 0 {
            resource.unreported_polls = resource.unreported_polls.saturating_sub(1);
            return Ok(Some(PodState::default()));
        }
        Ok(Some(
            inner
                .pod_states
                .get(name)
                .cloned()
                .unwrap_or_else(|| self.initial_state.clone()),
        ))
    }

    async fn get_resource_usage(&self, name: &str, _namespace: &str) -> Result<ResourceUsage> {
        self.usage_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_usage.load(Ordering::SeqCst) {
            return Err(OrchestratorError::Unavailable(
                "mock metrics unavailable".to_string(),
            ));
        }
        let inner = self.state.lock().await;
        Ok(inner.usage.get(name).cloned().unwrap_or(ResourceUsage {
            cpu: "100m".to_string(),
            memory: "256Mi".to_string(),
        }))
    }
}
