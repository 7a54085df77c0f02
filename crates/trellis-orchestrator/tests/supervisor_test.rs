// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration tests for the execution supervisor.
//!
//! Runs scripted engines through the supervisor against the in-memory store and
//! the mock orchestrator.

mod common;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::{FakeEngine, FakeLoader, Outcome, catalog, wait_for_run_status, wait_for_terminal_run};
use trellis_orchestrator::allocation::{
    AllocationConfig, AllocationKind, AllocationManager, AllocationStatus, PodAllocation,
};
use trellis_orchestrator::cache::{CacheConfig, StudyManager, StudyManagerCache};
use trellis_orchestrator::config::ExecutionStrategy;
use trellis_orchestrator::error::Error;
use trellis_orchestrator::orchestrator::{
    MockOrchestrator, Orchestrator, ResourceKind, ResourceUsage,
};
use trellis_orchestrator::persistence::{MemoryPersistence, NewAllocation, Persistence};
use trellis_orchestrator::pipeline::PipelineConfig;
use trellis_orchestrator::supervisor::{
    ExecutionError, ExecutionSupervisor, MODIFICATION_STEP, RunStatus, SupervisorConfig,
};

const STUDY: i64 = 1;
const NAMESPACE: &str = "trellis-test";

struct Harness {
    store: Arc<MemoryPersistence>,
    loader: Arc<FakeLoader>,
    cache: StudyManagerCache,
    orchestrator: Arc<MockOrchestrator>,
    allocations: Arc<AllocationManager>,
    supervisor: Arc<ExecutionSupervisor>,
}

impl Harness {
    async fn new(outcome: Outcome, batch: ExecutionStrategy) -> Self {
        Self::with_orchestrator(outcome, batch, MockOrchestrator::new()).await
    }

    async fn with_orchestrator(
        outcome: Outcome,
        batch: ExecutionStrategy,
        orchestrator: MockOrchestrator,
    ) -> Self {
        let store = Arc::new(MemoryPersistence::new());
        store.insert_study(STUDY, Utc::now()).await;

        let loader = Arc::new(FakeLoader::new(outcome));
        let cache = StudyManagerCache::new(store.clone(), loader.clone(), CacheConfig::default());

        let orchestrator = Arc::new(orchestrator);
        let config = AllocationConfig {
            session_strategy: batch,
            batch_strategy: batch,
            flavors: catalog(),
            namespace: NAMESPACE.to_string(),
            subprocess_command: vec!["sleep".to_string(), "30".to_string()],
            phase_wait_timeout: Duration::from_millis(200),
            phase_poll_interval: Duration::from_millis(10),
            ..AllocationConfig::default()
        };
        let allocations = Arc::new(
            AllocationManager::new(
                store.clone(),
                Some(orchestrator.clone() as Arc<dyn Orchestrator>),
                config,
            )
            .unwrap(),
        );

        let supervisor = Arc::new(ExecutionSupervisor::new(
            store.clone(),
            allocations.clone(),
            Some(orchestrator.clone() as Arc<dyn Orchestrator>),
            SupervisorConfig {
                pipeline: PipelineConfig {
                    flush_interval: Duration::from_millis(50),
                    ..PipelineConfig::default()
                },
                sample_interval: Duration::from_millis(20),
            },
        ));

        Self {
            store,
            loader,
            cache,
            orchestrator,
            allocations,
            supervisor,
        }
    }

    async fn study(&self) -> Arc<StudyManager> {
        self.cache.get(STUDY, true).await.unwrap()
    }

    fn engine(&self) -> Arc<FakeEngine> {
        self.loader.engines(STUDY).pop().expect("study not loaded")
    }

    async fn modified_at(&self) -> DateTime<Utc> {
        self.store
            .get_study_modified_at(STUDY)
            .await
            .unwrap()
            .unwrap()
    }

    /// Create a run and its allocation without starting the computation.
    async fn prepare_run(&self) -> (i64, PodAllocation) {
        let run = self.store.create_run(STUDY).await.unwrap();
        let allocation = self
            .allocations
            .allocate(run.id, AllocationKind::Execution, "medium")
            .await
            .unwrap();
        (run.id, allocation)
    }

    /// Wait until no computation runs in this process.
    async fn wait_idle(&self) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
        while self.supervisor.running_count() > 0 {
            assert!(
                tokio::time::Instant::now() < deadline,
                "computation never ended"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

// ============================================================================
// Completion
// ============================================================================

#[tokio::test]
async fn test_thread_submission_runs_to_completion() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let before = h.modified_at().await;
    let study = h.study().await;

    let run = h.supervisor.submit(study, "medium").await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    let finished = wait_for_terminal_run(h.store.as_ref(), run.id).await;
    h.wait_idle().await;
    assert_eq!(finished.status, RunStatus::Finished);
    assert!(finished.started_at.is_some());
    assert!(finished.finished_at.is_some());

    // Only the last status of each sub-unit is kept
    let statuses = h.store.list_sub_unit_statuses(run.id).await.unwrap();
    let latest: Vec<(&str, &str)> = statuses
        .iter()
        .map(|s| (s.sub_unit_id.as_str(), s.status.as_str()))
        .collect();
    assert_eq!(latest, vec![("node-a", "done"), ("node-b", "done")]);

    let engine = h.engine();
    assert!(engine.started.load(Ordering::SeqCst));
    assert!(engine.artifacts_persisted.load(Ordering::SeqCst));
    assert_eq!(engine.observer_count(), 0);

    assert!(h.modified_at().await > before);

    let completed = h
        .store
        .list_completed_allocations_before(Utc::now() + chrono::Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].identifier, run.id);
    assert_eq!(completed[0].kind, AllocationKind::Execution);
}

#[tokio::test]
async fn test_failed_computation_is_reported() {
    let h = Harness::new(
        Outcome::Fail("matrix is singular".to_string()),
        ExecutionStrategy::Thread,
    )
    .await;
    let study = h.study().await;
    let (run_id, allocation) = h.prepare_run().await;

    let err = h.supervisor.start(run_id, study).await.unwrap_err();
    assert!(matches!(
        err,
        Error::Computation(ExecutionError::Computation { run_id: id, .. }) if id == run_id
    ));

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert!(run.message.unwrap().contains("matrix is singular"));

    let row = h
        .store
        .get_allocation(allocation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, AllocationStatus::InError);

    // Statuses and artifacts produced before the failure are still persisted
    assert_eq!(h.store.list_sub_unit_statuses(run_id).await.unwrap().len(), 2);
    assert!(h.engine().artifacts_persisted.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_allocation_lookup_error_does_not_strand_run() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let study = h.study().await;
    let (run_id, allocation) = h.prepare_run().await;

    h.store.set_fail_allocation_lookups(true);
    let status = h.supervisor.start(run_id, study).await.unwrap();
    h.store.set_fail_allocation_lookups(false);

    assert_eq!(status, RunStatus::Finished);
    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);
    assert!(h.engine().artifacts_persisted.load(Ordering::SeqCst));

    // The allocation was never found, so it is left for reconciliation
    let row = h
        .store
        .get_allocation(allocation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, AllocationStatus::Running);
}

#[tokio::test]
async fn test_run_status_write_error_still_finishes_allocation() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let study = h.study().await;
    let (run_id, allocation) = h.prepare_run().await;

    h.store.set_fail_run_completion(true);
    let status = h.supervisor.start(run_id, study).await.unwrap();
    h.store.set_fail_run_completion(false);

    assert_eq!(status, RunStatus::Finished);
    let row = h
        .store
        .get_allocation(allocation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.status, AllocationStatus::Completed);
    assert_eq!(h.supervisor.running_count(), 0);
}

#[tokio::test]
async fn test_unloaded_study_is_not_runnable() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    h.loader.set_read_only(STUDY);
    let study = h.study().await;

    let err = h.supervisor.submit(study, "medium").await.unwrap_err();
    assert!(matches!(
        err,
        Error::Computation(ExecutionError::NotRunnable { study_id: STUDY, .. })
    ));
}

#[tokio::test]
async fn test_modification_timestamp_steps_past_future_value() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let future = Utc::now() + chrono::Duration::hours(1);
    h.store.set_study_modified_at(STUDY, future).await.unwrap();
    let study = h.study().await;
    let (run_id, _) = h.prepare_run().await;

    let status = h.supervisor.start(run_id, study).await.unwrap();
    assert_eq!(status, RunStatus::Finished);

    let step = chrono::Duration::from_std(MODIFICATION_STEP).unwrap();
    assert_eq!(h.modified_at().await, future + step);

    // The next run steps again
    let study = h.study().await;
    let (run_id, _) = h.prepare_run().await;
    h.supervisor.start(run_id, study).await.unwrap();
    assert_eq!(h.modified_at().await, future + step + step);
}

#[tokio::test]
async fn test_orchestrated_run_samples_pod_usage() {
    let h = Harness::new(
        Outcome::SucceedAfter(Duration::from_millis(200)),
        ExecutionStrategy::Orchestrator,
    )
    .await;
    let study = h.study().await;
    let (run_id, allocation) = h.prepare_run().await;
    h.orchestrator
        .set_usage(
            &allocation.pod_name,
            ResourceUsage {
                cpu: "1500m".to_string(),
                memory: "2Gi".to_string(),
            },
        )
        .await;

    let status = h.supervisor.start(run_id, study).await.unwrap();
    assert_eq!(status, RunStatus::Finished);
    assert!(h.orchestrator.usage_calls() > 0);

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.cpu_usage, Some(1.5));
    assert_eq!(run.memory_usage, Some(2048.0));
}

// ============================================================================
// Allocation failures
// ============================================================================

#[tokio::test]
async fn test_allocation_failure_fails_the_run() {
    let h = Harness::with_orchestrator(
        Outcome::Succeed,
        ExecutionStrategy::Orchestrator,
        MockOrchestrator::failing(),
    )
    .await;
    let study = h.study().await;

    let err = h.supervisor.submit(study, "medium").await.unwrap_err();
    let Error::Computation(ExecutionError::Allocation { run_id, message }) = err else {
        panic!("expected allocation failure");
    };
    assert!(message.contains("failed to create pod"));

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Failed);
    assert_eq!(run.message.as_deref(), Some(message.as_str()));
    assert!(!h.engine().started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_orchestrated_submission_leaves_computation_to_the_pod() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Orchestrator).await;
    let study = h.study().await;

    let run = h.supervisor.submit(study, "xlarge").await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;

    let stored = h.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Pending);
    assert_eq!(h.supervisor.running_count(), 0);

    let allocation = h
        .allocations
        .find_active(run.id, AllocationKind::Execution)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(allocation.flavor, "xlarge");
    assert!(
        h.orchestrator
            .exists(ResourceKind::Pod, &allocation.pod_name, NAMESPACE)
            .await
    );
}

// ============================================================================
// Stopping
// ============================================================================

#[tokio::test]
async fn test_stop_cancels_running_computation() {
    let h = Harness::new(Outcome::WaitForCancel, ExecutionStrategy::Thread).await;
    let study = h.study().await;

    let run = h.supervisor.submit(study, "medium").await.unwrap();
    wait_for_run_status(h.store.as_ref(), run.id, RunStatus::Running).await;

    assert!(h.supervisor.stop(run.id).await.unwrap());
    h.wait_idle().await;

    let stopped = h.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stopped.status, RunStatus::Stopped);
    assert!(
        h.allocations
            .find_active(run.id, AllocationKind::Execution)
            .await
            .unwrap()
            .is_none()
    );

    // Stopping again is a no-op
    assert!(!h.supervisor.stop(run.id).await.unwrap());
}

#[tokio::test]
async fn test_late_completion_does_not_overwrite_stop() {
    let h = Harness::new(
        Outcome::SucceedAfter(Duration::from_millis(300)),
        ExecutionStrategy::Thread,
    )
    .await;
    let study = h.study().await;
    let (run_id, _) = h.prepare_run().await;

    let computation = {
        let supervisor = h.supervisor.clone();
        tokio::spawn(async move { supervisor.start(run_id, study).await })
    };
    wait_for_run_status(h.store.as_ref(), run_id, RunStatus::Running).await;

    assert!(h.supervisor.stop(run_id).await.unwrap());

    // The engine ignores the token and finishes successfully
    let status = computation.await.unwrap().unwrap();
    assert_eq!(status, RunStatus::Stopped);

    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Stopped);
    assert_eq!(run.message.as_deref(), Some("stopped on request"));
}

#[tokio::test]
async fn test_stop_before_start_prevents_computation() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let study = h.study().await;
    let (run_id, _) = h.prepare_run().await;

    assert!(h.supervisor.stop(run_id).await.unwrap());

    let status = h.supervisor.start(run_id, study).await.unwrap();
    assert_eq!(status, RunStatus::Stopped);
    assert!(!h.engine().started.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_stop_finished_or_unknown_run() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Thread).await;
    let study = h.study().await;
    let (run_id, _) = h.prepare_run().await;
    h.supervisor.start(run_id, study).await.unwrap();

    assert!(!h.supervisor.stop(run_id).await.unwrap());
    let run = h.store.get_run(run_id).await.unwrap().unwrap();
    assert_eq!(run.status, RunStatus::Finished);

    assert!(matches!(
        h.supervisor.stop(999).await,
        Err(Error::RunNotFound(999))
    ));
}

#[tokio::test]
async fn test_stop_orchestrated_run_deletes_pod() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Orchestrator).await;
    let study = h.study().await;
    let run = h.supervisor.submit(study, "medium").await.unwrap();
    let allocation = h
        .allocations
        .find_active(run.id, AllocationKind::Execution)
        .await
        .unwrap()
        .unwrap();

    assert!(h.supervisor.stop(run.id).await.unwrap());

    assert!(
        !h.orchestrator
            .exists(ResourceKind::Pod, &allocation.pod_name, NAMESPACE)
            .await
    );
    assert!(h.store.get_allocation(allocation.id).await.unwrap().is_none());
    let stored = h.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Stopped);
}

#[tokio::test]
async fn test_stop_subprocess_run_removes_allocation() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Subprocess).await;
    let study = h.study().await;
    let run = h.supervisor.submit(study, "medium").await.unwrap();
    let allocation = h
        .allocations
        .find_active(run.id, AllocationKind::Execution)
        .await
        .unwrap()
        .unwrap();
    assert!(allocation.pid.is_some());

    assert!(h.supervisor.stop(run.id).await.unwrap());

    assert!(h.store.get_allocation(allocation.id).await.unwrap().is_none());
    let stored = h.store.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Stopped);
}

#[tokio::test]
async fn test_stop_session_deletes_resources() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Orchestrator).await;
    let allocation = h
        .allocations
        .allocate(STUDY, AllocationKind::StudySession, "small")
        .await
        .unwrap();
    assert!(
        h.orchestrator
            .exists(ResourceKind::Service, &allocation.pod_name, NAMESPACE)
            .await
    );

    h.supervisor.stop_session(STUDY).await.unwrap();

    assert!(
        !h.orchestrator
            .exists(ResourceKind::Pod, &allocation.pod_name, NAMESPACE)
            .await
    );
    assert!(
        !h.orchestrator
            .exists(ResourceKind::Service, &allocation.pod_name, NAMESPACE)
            .await
    );
    assert!(h.store.get_allocation(allocation.id).await.unwrap().is_none());

    // Nothing left to stop
    h.supervisor.stop_session(STUDY).await.unwrap();
}

#[tokio::test]
async fn test_stop_session_never_started_skips_orchestrator() {
    let h = Harness::new(Outcome::Succeed, ExecutionStrategy::Orchestrator).await;
    let allocation = h
        .store
        .insert_allocation(&NewAllocation {
            identifier: STUDY,
            kind: AllocationKind::StudySession,
            flavor: "small".to_string(),
            strategy: ExecutionStrategy::Orchestrator,
            pod_name: "study-session-1".to_string(),
            namespace: NAMESPACE.to_string(),
            status: AllocationStatus::NotStarted,
        })
        .await
        .unwrap();

    h.supervisor.stop_session(STUDY).await.unwrap();

    assert!(h.store.get_allocation(allocation.id).await.unwrap().is_none());
    assert!(h.orchestrator.deleted().await.is_empty());
}
