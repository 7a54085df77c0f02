// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Orchestrator client backed by the `kubectl` command line.
//!
//! Manifests are applied from stdin and pod status is read back as JSON.
//! Pure resource logic, no database access.

use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use crate::orchestrator::{
    Orchestrator, OrchestratorError, PodState, ResourceKind, ResourceSpec, ResourceUsage, Result,
};

/// Configuration for [`KubectlOrchestrator`].
#[derive(Debug, Clone)]
pub struct KubectlConfig {
    /// Path to the kubectl binary
    pub kubectl: String,
    /// Kubeconfig context to use (current context when unset)
    pub context: Option<String>,
}

impl Default for KubectlConfig {
    fn default() -> Self {
        Self {
            kubectl: "kubectl".to_string(),
            context: None,
        }
    }
}

impl KubectlConfig {
    /// Create configuration from environment variables
    pub fn from_env() -> Self {
        Self {
            kubectl: std::env::var("TRELLIS_KUBECTL").unwrap_or_else(|_| "kubectl".to_string()),
            context: std::env::var("TRELLIS_KUBE_CONTEXT").ok(),
        }
    }
}

/// Orchestrator client that shells out to kubectl.
pub struct KubectlOrchestrator {
    config: KubectlConfig,
}

impl KubectlOrchestrator {
    /// Create a new kubectl client
    pub fn new(config: KubectlConfig) -> Self {
        Self { config }
    }

    /// Create from environment variables
    pub fn from_env() -> Self {
        Self::new(KubectlConfig::from_env())
    }

    fn command(&self, namespace: &str) -> Command {
        let mut cmd = Command::new(&self.config.kubectl);
        if let Some(context) = &self.config.context {
            cmd.args(["--context", context.as_str()]);
        }
        cmd.args(["--namespace", namespace]);
        cmd.kill_on_drop(true);
        cmd
    }
}

fn is_not_found(stderr: &str) -> bool {
    stderr.contains("NotFound") || stderr.contains("not found")
}

fn failure(stderr: &[u8]) -> OrchestratorError {
    let stderr = String::from_utf8_lossy(stderr).trim().to_string();
    if stderr.contains("Unable to connect") || stderr.contains("connection refused") {
        OrchestratorError::Unavailable(stderr)
    } else {
        OrchestratorError::RequestFailed(stderr)
    }
}

/// Parse one line of `kubectl top pod --no-headers` output.
fn parse_top_line(line: &str) -> Option<ResourceUsage> {
    let mut fields = line.split_whitespace();
    let _name = fields.next()?;
    let cpu = fields.next()?;
    let memory = fields.next()?;
    Some(ResourceUsage {
        cpu: cpu.to_string(),
        memory: memory.to_string(),
    })
}

#[async_trait]
impl Orchestrator for KubectlOrchestrator {
    fn orchestrator_type(&self) -> &'static str {
        "kubectl"
    }

    async fn create_resource(&self, spec: &ResourceSpec) -> Result<String> {
        let manifest = serde_json::to_vec(&spec.manifest)?;

        let mut child = self
            .command(&spec.namespace)
            .args(["apply", "-f", "-", "-o", "name"])
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| OrchestratorError::Unavailable(format!("cannot run kubectl: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(&manifest).await?;
            stdin.shutdown().await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(failure(&output.stderr));
        }

        debug!(
            kind = %spec.kind,
            name = %spec.name,
            namespace = %spec.namespace,
            "Applied resource manifest"
        );

        Ok(spec.name.clone())
    }

    async fn delete_resource(
        &self,
        kind: ResourceKind,
        name: &str,
        namespace: &str,
    ) -> Result<()> {
        let output = self
            .command(namespace)
            .args(["delete", kind.as_str(), name, "--ignore-not-found", "--wait=false"])
            .output()
            .await?;

        if !output.status.success() {
            return Err(failure(&output.stderr));
        }

        debug!(kind = %kind, name = %name, namespace = %namespace, "Deleted resource");
        Ok(())
    }

    async fn get_resource_phase(&self, name: &str, namespace: &str) -> Result<Option<PodState>> {
        let output = self
            .command(namespace)
            .args(["get", "pod", name, "-o", "json"])
            .output()
            .await?;

        if !output.status.success() {
            if is_not_found(&String::from_utf8_lossy(&output.stderr)) {
                return Ok(None);
            }
            return Err(failure(&output.stderr));
        }

        let pod: Value = serde_json::from_slice(&output.stdout)?;
        Ok(Some(PodState::from_pod_json(&pod)?))
    }

    async fn get_resource_usage(&self, name: &str, namespace: &str) -> Result<ResourceUsage> {
        let output = self
            .command(namespace)
            .args(["top", "pod", name, "--no-headers"])
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_not_found(&stderr) {
                return Err(OrchestratorError::NotFound(name.to_string()));
            }
            return Err(failure(&output.stderr));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        stdout
            .lines()
            .find_map(parse_top_line)
            .ok_or_else(|| OrchestratorError::InvalidResponse(stdout.trim().to_string()))
    }
}
