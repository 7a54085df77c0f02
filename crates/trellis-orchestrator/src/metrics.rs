// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Periodic resource usage sampling for execution runs.
//!
//! A [`MetricsSampler`] polls a [`UsageSource`] on a fixed interval and writes
//! the latest CPU (cores) and memory (MB) to the run record. Failed samples are
//! logged and skipped; they never stop the sampler.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::orchestrator::Orchestrator;
use crate::persistence::Persistence;
use crate::units::{self, MemoryUnit};

/// Default sampling interval.
pub const DEFAULT_SAMPLE_INTERVAL: Duration = Duration::from_secs(2);

/// One usage sample.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UsageSample {
    /// CPU usage in cores.
    pub cpu: f64,
    /// Memory usage in MB (1024-based).
    pub memory_mb: f64,
}

/// Source of usage samples for one workload.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Take a sample.
    async fn sample(&self) -> Result<UsageSample>;
}

/// Usage of an orchestrator pod, as reported by the orchestrator's metrics API.
pub struct OrchestratorUsage {
    orchestrator: Arc<dyn Orchestrator>,
    pod_name: String,
    namespace: String,
}

impl OrchestratorUsage {
    /// Create a source for one pod.
    pub fn new(orchestrator: Arc<dyn Orchestrator>, pod_name: &str, namespace: &str) -> Self {
        Self {
            orchestrator,
            pod_name: pod_name.to_string(),
            namespace: namespace.to_string(),
        }
    }
}

#[async_trait]
impl UsageSource for OrchestratorUsage {
    async fn sample(&self) -> Result<UsageSample> {
        let usage = self
            .orchestrator
            .get_resource_usage(&self.pod_name, &self.namespace)
            .await?;
        Ok(UsageSample {
            cpu: units::parse_cpu_quantity(&usage.cpu)?,
            memory_mb: units::parse_memory_as(&usage.memory, MemoryUnit::Mb)?,
        })
    }
}

/// Usage of this process's cgroup (cgroup v2).
///
/// CPU is derived from the `usage_usec` delta between two samples, so the first
/// sample reports zero cores.
pub struct HostUsage {
    cgroup_dir: PathBuf,
    last_cpu: Mutex<Option<(u64, Instant)>>,
}

impl HostUsage {
    /// Create a source reading from a cgroup directory.
    pub fn new(cgroup_dir: impl Into<PathBuf>) -> Self {
        Self {
            cgroup_dir: cgroup_dir.into(),
            last_cpu: Mutex::new(None),
        }
    }

    /// Locate the cgroup v2 directory of the current process.
    pub async fn detect() -> Result<Self> {
        let cgroup_info = tokio::fs::read_to_string("/proc/self/cgroup").await?;
        // cgroups v2 format: "0::/path/to/cgroup"
        let path = cgroup_info
            .lines()
            .find_map(|line| line.strip_prefix("0::"))
            .ok_or_else(|| Error::Other("cgroup v2 hierarchy not found".to_string()))?;
        Ok(Self::new(format!("/sys/fs/cgroup{}", path.trim())))
    }

    /// Directory samples are read from.
    pub fn cgroup_dir(&self) -> &Path {
        &self.cgroup_dir
    }
}

async fn read_cgroup_value(path: &Path) -> Result<u64> {
    let content = tokio::fs::read_to_string(path).await?;
    content
        .trim()
        .parse::<u64>()
        .map_err(|e| Error::Other(format!("invalid value in {}: {}", path.display(), e)))
}

async fn read_cpu_usage_usec(path: &Path) -> Result<u64> {
    let content = tokio::fs::read_to_string(path).await?;
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() == 2
            && parts[0] == "usage_usec"
            && let Ok(value) = parts[1].parse::<u64>()
        {
            return Ok(value);
        }
    }
    Err(Error::Other(format!(
        "usage_usec missing from {}",
        path.display()
    )))
}

#[async_trait]
impl UsageSource for HostUsage {
    async fn sample(&self) -> Result<UsageSample> {
        let memory_bytes = read_cgroup_value(&self.cgroup_dir.join("memory.current")).await?;
        let usage_usec = read_cpu_usage_usec(&self.cgroup_dir.join("cpu.stat")).await?;
        let now = Instant::now();

        let mut last = self.last_cpu.lock().await;
        let cpu = match *last {
            Some((prev_usec, prev_at)) => {
                let elapsed = now.duration_since(prev_at).as_secs_f64();
                if elapsed > 0.0 {
                    usage_usec.saturating_sub(prev_usec) as f64 / 1_000_000.0 / elapsed
                } else {
                    0.0
                }
            }
            None => 0.0,
        };
        *last = Some((usage_usec, now));

        Ok(UsageSample {
            cpu,
            memory_mb: units::convert_memory(memory_bytes as f64, MemoryUnit::Bytes, MemoryUnit::Mb),
        })
    }
}

/// Background sampler writing usage to one run.
pub struct MetricsSampler {
    run_id: i64,
    shutdown: Arc<Notify>,
    worker: Option<JoinHandle<()>>,
}

impl MetricsSampler {
    /// Start sampling.
    pub fn start(
        source: Arc<dyn UsageSource>,
        persistence: Arc<dyn Persistence>,
        run_id: i64,
        interval: Duration,
    ) -> Self {
        let shutdown = Arc::new(Notify::new());
        let worker = tokio::spawn(sample_loop(
            source,
            persistence,
            run_id,
            interval,
            shutdown.clone(),
        ));
        Self {
            run_id,
            shutdown,
            worker: Some(worker),
        }
    }

    /// Stop the sampler and wait for it to exit.
    pub async fn stop(mut self) {
        self.shutdown.notify_one();
        if let Some(worker) = self.worker.take()
            && let Err(e) = worker.await
        {
            warn!(run_id = self.run_id, error = %e, "Metrics sampler panicked");
        }
    }
}

impl Drop for MetricsSampler {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            worker.abort();
        }
    }
}

async fn sample_loop(
    source: Arc<dyn UsageSource>,
    persistence: Arc<dyn Persistence>,
    run_id: i64,
    interval: Duration,
    shutdown: Arc<Notify>,
) {
    loop {
        tokio::select! {
            biased;

            _ = shutdown.notified() => break,

            _ = tokio::time::sleep(interval) => {
                match source.sample().await {
                    Ok(sample) => {
                        debug!(
                            run_id = run_id,
                            cpu = sample.cpu,
                            memory_mb = sample.memory_mb,
                            "Sampled resource usage"
                        );
                        if let Err(e) = persistence
                            .update_run_usage(run_id, sample.cpu, sample.memory_mb)
                            .await
                        {
                            warn!(run_id = run_id, error = %e, "Failed to record resource usage");
                        }
                    }
                    Err(e) => {
                        warn!(run_id = run_id, error = %e, "Failed to sample resource usage");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::{MockOrchestrator, ResourceUsage};
    use crate::persistence::MemoryPersistence;

    #[tokio::test]
    async fn test_orchestrator_usage_parses_quantities() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator
            .set_usage(
                "pod-1",
                ResourceUsage {
                    cpu: "250m".to_string(),
                    memory: "1Gi".to_string(),
                },
            )
            .await;

        let source = OrchestratorUsage::new(orchestrator, "pod-1", "default");
        let sample = source.sample().await.unwrap();
        assert!((sample.cpu - 0.25).abs() < 1e-9);
        assert!((sample.memory_mb - 1024.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_host_usage_reads_cgroup_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("memory.current"), "536870912\n").unwrap();
        std::fs::write(
            dir.path().join("cpu.stat"),
            "usage_usec 1000000\nuser_usec 800000\nsystem_usec 200000\n",
        )
        .unwrap();

        let source = HostUsage::new(dir.path());
        let sample = source.sample().await.unwrap();
        assert_eq!(sample.cpu, 0.0);
        assert!((sample.memory_mb - 512.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_sampler_survives_failures() {
        let orchestrator = Arc::new(MockOrchestrator::new());
        orchestrator.set_usage_failing(true);
        let store = Arc::new(MemoryPersistence::new());
        let run = store.create_run(1).await.unwrap();

        let source = Arc::new(OrchestratorUsage::new(orchestrator.clone(), "pod", "default"));
        let sampler = MetricsSampler::start(
            source,
            store.clone(),
            run.id,
            Duration::from_millis(10),
        );

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(orchestrator.usage_calls() >= 2);
        assert!(store.get_run(run.id).await.unwrap().unwrap().cpu_usage.is_none());

        orchestrator.set_usage_failing(false);
        tokio::time::sleep(Duration::from_millis(50)).await;
        sampler.stop().await;

        let run = store.get_run(run.id).await.unwrap().unwrap();
        assert!((run.cpu_usage.unwrap() - 0.1).abs() < 1e-9);
        assert!((run.memory_usage.unwrap() - 256.0).abs() < 1e-9);
    }
}
