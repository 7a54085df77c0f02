// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-process persistence backend.
//!
//! Used in thread mode without a database and by tests. Guarded updates follow
//! the same rules as the Postgres backend.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use super::{NewAllocation, Persistence, SubUnitStatus};
use crate::allocation::{AllocationKind, AllocationStatus, PodAllocation};
use crate::error::{Error, Result};
use crate::supervisor::{ExecutionRun, RunStatus};

#[derive(Debug, Clone, Default)]
struct StudyRow {
    modified_at: Option<DateTime<Utc>>,
    last_active: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryState {
    studies: HashMap<i64, StudyRow>,
    allocations: BTreeMap<i64, PodAllocation>,
    runs: BTreeMap<i64, ExecutionRun>,
    sub_units: HashMap<i64, BTreeMap<String, SubUnitStatus>>,
    status_batches: Vec<(i64, Vec<SubUnitStatus>)>,
    next_allocation_id: i64,
    next_run_id: i64,
}

/// In-memory persistence.
#[derive(Debug, Default)]
pub struct MemoryPersistence {
    state: Mutex<MemoryState>,
    fail_status_writes: AtomicBool,
    failed_status_writes: AtomicU32,
    fail_allocation_lookups: AtomicBool,
    fail_run_completion: AtomicBool,
}

impl MemoryPersistence {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a study with its modification timestamp.
    pub async fn insert_study(&self, study_id: i64, modified_at: DateTime<Utc>) {
        self.state.lock().await.studies.insert(
            study_id,
            StudyRow {
                modified_at: Some(modified_at),
                last_active: None,
            },
        );
    }

    /// Last-activity timestamp written for a study.
    pub async fn last_active(&self, study_id: i64) -> Option<DateTime<Utc>> {
        self.state
            .lock()
            .await
            .studies
            .get(&study_id)
            .and_then(|s| s.last_active)
    }

    /// Every sub-unit status batch written so far, in order.
    pub async fn status_batches(&self) -> Vec<(i64, Vec<SubUnitStatus>)> {
        self.state.lock().await.status_batches.clone()
    }

    /// Make sub-unit status writes fail (or succeed again).
    pub fn set_fail_status_writes(&self, failing: bool) {
        self.fail_status_writes.store(failing, Ordering::SeqCst);
    }

    /// Number of sub-unit status writes rejected so far.
    pub fn failed_status_writes(&self) -> u32 {
        self.failed_status_writes.load(Ordering::SeqCst)
    }

    /// Make active-allocation lookups fail (or succeed again).
    pub fn set_fail_allocation_lookups(&self, failing: bool) {
        self.fail_allocation_lookups.store(failing, Ordering::SeqCst);
    }

    /// Make terminal run status writes fail (or succeed again).
    pub fn set_fail_run_completion(&self, failing: bool) {
        self.fail_run_completion.store(failing, Ordering::SeqCst);
    }
}

fn is_active(status: AllocationStatus) -> bool {
    !status.is_terminal()
}

#[async_trait]
impl Persistence for MemoryPersistence {
    async fn get_study_modified_at(&self, study_id: i64) -> Result<Option<DateTime<Utc>>> {
        Ok(self
            .state
            .lock()
            .await
            .studies
            .get(&study_id)
            .and_then(|s| s.modified_at))
    }

    async fn set_study_modified_at(
        &self,
        study_id: i64,
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let study = state
            .studies
            .get_mut(&study_id)
            .ok_or(Error::StudyNotFound(study_id))?;
        study.modified_at = Some(modified_at);
        Ok(())
    }

    async fn touch_study_last_active(&self, study_id: i64, at: DateTime<Utc>) -> Result<()> {
        let mut state = self.state.lock().await;
        let study = state
            .studies
            .get_mut(&study_id)
            .ok_or(Error::StudyNotFound(study_id))?;
        study.last_active = Some(at);
        Ok(())
    }

    async fn insert_allocation(&self, allocation: &NewAllocation) -> Result<PodAllocation> {
        let mut state = self.state.lock().await;
        state.next_allocation_id += 1;
        let row = PodAllocation {
            id: state.next_allocation_id,
            identifier: allocation.identifier,
            kind: allocation.kind,
            flavor: allocation.flavor.clone(),
            strategy: allocation.strategy,
            pod_name: allocation.pod_name.clone(),
            namespace: allocation.namespace.clone(),
            status: allocation.status,
            message: None,
            pid: None,
            created_at: Utc::now(),
        };
        state.allocations.insert(row.id, row.clone());
        Ok(row)
    }

    async fn get_allocation(&self, allocation_id: i64) -> Result<Option<PodAllocation>> {
        Ok(self
            .state
            .lock()
            .await
            .allocations
            .get(&allocation_id)
            .cloned())
    }

    async fn list_active_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>> {
        if self.fail_allocation_lookups.load(Ordering::SeqCst) {
            return Err(Error::Other("allocation lookup rejected".to_string()));
        }
        let state = self.state.lock().await;
        // BTreeMap iterates by ascending id, reverse for newest first
        Ok(state
            .allocations
            .values()
            .rev()
            .filter(|a| a.identifier == identifier && a.kind == kind && is_active(a.status))
            .cloned()
            .collect())
    }

    async fn list_terminal_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>> {
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .values()
            .rev()
            .filter(|a| a.identifier == identifier && a.kind == kind && a.status.is_terminal())
            .cloned()
            .collect())
    }

    async fn list_unfinished_allocations(&self) -> Result<Vec<PodAllocation>> {
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .values()
            .filter(|a| a.status != AllocationStatus::Completed)
            .cloned()
            .collect())
    }

    async fn list_completed_allocations_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PodAllocation>> {
        let state = self.state.lock().await;
        Ok(state
            .allocations
            .values()
            .filter(|a| a.status == AllocationStatus::Completed && a.created_at < cutoff)
            .cloned()
            .collect())
    }

    async fn update_allocation_status(
        &self,
        allocation_id: i64,
        status: AllocationStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(allocation) = state.allocations.get_mut(&allocation_id) {
            allocation.status = status;
            allocation.message = message.map(str::to_string);
        }
        Ok(())
    }

    async fn update_allocation_pid(&self, allocation_id: i64, pid: i32) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(allocation) = state.allocations.get_mut(&allocation_id) {
            allocation.pid = Some(pid);
        }
        Ok(())
    }

    async fn delete_allocation(&self, allocation_id: i64) -> Result<bool> {
        Ok(self
            .state
            .lock()
            .await
            .allocations
            .remove(&allocation_id)
            .is_some())
    }

    async fn create_run(&self, study_id: i64) -> Result<ExecutionRun> {
        let mut state = self.state.lock().await;
        state.next_run_id += 1;
        let run = ExecutionRun {
            id: state.next_run_id,
            study_id,
            status: RunStatus::Pending,
            message: None,
            cpu_usage: None,
            memory_usage: None,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
        };
        state.runs.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<ExecutionRun>> {
        Ok(self.state.lock().await.runs.get(&run_id).cloned())
    }

    async fn mark_run_running(&self, run_id: i64) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Running;
                run.started_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn complete_run_if_running(
        &self,
        run_id: i64,
        status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        if self.fail_run_completion.load(Ordering::SeqCst) {
            return Err(Error::Other("run completion rejected".to_string()));
        }
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Running => {
                run.status = status;
                run.message = message.map(str::to_string);
                run.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stop_run_if_active(&self, run_id: i64, message: Option<&str>) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if matches!(run.status, RunStatus::Pending | RunStatus::Running) => {
                run.status = RunStatus::Stopped;
                run.message = message.map(str::to_string);
                run.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn fail_pending_run(&self, run_id: i64, message: &str) -> Result<bool> {
        let mut state = self.state.lock().await;
        match state.runs.get_mut(&run_id) {
            Some(run) if run.status == RunStatus::Pending => {
                run.status = RunStatus::Failed;
                run.message = Some(message.to_string());
                run.finished_at = Some(Utc::now());
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn update_run_usage(&self, run_id: i64, cpu: f64, memory_mb: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        if let Some(run) = state.runs.get_mut(&run_id) {
            run.cpu_usage = Some(cpu);
            run.memory_usage = Some(memory_mb);
        }
        Ok(())
    }

    async fn upsert_sub_unit_statuses(
        &self,
        run_id: i64,
        statuses: &[SubUnitStatus],
    ) -> Result<()> {
        if self.fail_status_writes.load(Ordering::SeqCst) {
            self.failed_status_writes.fetch_add(1, Ordering::SeqCst);
            return Err(Error::Other("status write rejected".to_string()));
        }

        let mut state = self.state.lock().await;
        let rows = state.sub_units.entry(run_id).or_default();
        for status in statuses {
            rows.insert(status.sub_unit_id.clone(), status.clone());
        }
        state.status_batches.push((run_id, statuses.to_vec()));
        Ok(())
    }

    async fn list_sub_unit_statuses(&self, run_id: i64) -> Result<Vec<SubUnitStatus>> {
        Ok(self
            .state
            .lock()
            .await
            .sub_units
            .get(&run_id)
            .map(|rows| rows.values().cloned().collect())
            .unwrap_or_default())
    }
}
