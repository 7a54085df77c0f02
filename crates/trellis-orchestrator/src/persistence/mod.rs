// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence interfaces and backends for trellis-orchestrator.
//!
//! This module defines the persistence abstraction and backend implementations.

pub mod memory;
pub mod postgres;

pub use self::memory::MemoryPersistence;
pub use self::postgres::PostgresPersistence;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::allocation::{AllocationKind, AllocationStatus, PodAllocation};
use crate::config::ExecutionStrategy;
use crate::error::Result;
use crate::supervisor::{ExecutionRun, RunStatus};

/// Latest status of one computation sub-unit within a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubUnitStatus {
    /// Sub-unit identifier.
    pub sub_unit_id: String,
    /// Status string reported by the engine.
    pub status: String,
    /// When the status was observed.
    pub updated_at: DateTime<Utc>,
}

/// Allocation row to insert.
#[derive(Debug, Clone)]
pub struct NewAllocation {
    /// Study, execution or reference-generation identifier.
    pub identifier: i64,
    /// Workload kind.
    pub kind: AllocationKind,
    /// Resolved flavor name.
    pub flavor: String,
    /// Strategy used to back the allocation.
    pub strategy: ExecutionStrategy,
    /// Orchestrator resource name.
    pub pod_name: String,
    /// Orchestrator namespace.
    pub namespace: String,
    /// Initial status.
    pub status: AllocationStatus,
}

/// Persistence interface used by the orchestration core.
#[allow(missing_docs)]
#[async_trait]
pub trait Persistence: Send + Sync {
    // ===== Studies =====

    /// Authoritative modification timestamp, `None` if the study does not exist.
    async fn get_study_modified_at(&self, study_id: i64) -> Result<Option<DateTime<Utc>>>;

    async fn set_study_modified_at(&self, study_id: i64, modified_at: DateTime<Utc>)
    -> Result<()>;

    async fn touch_study_last_active(&self, study_id: i64, at: DateTime<Utc>) -> Result<()>;

    // ===== Allocations =====

    async fn insert_allocation(&self, allocation: &NewAllocation) -> Result<PodAllocation>;

    async fn get_allocation(&self, allocation_id: i64) -> Result<Option<PodAllocation>>;

    /// Non-terminal allocations for (identifier, kind), newest first.
    async fn list_active_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>>;

    /// Terminal allocations for (identifier, kind), newest first.
    async fn list_terminal_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>>;

    /// Every allocation whose status is not `completed`.
    async fn list_unfinished_allocations(&self) -> Result<Vec<PodAllocation>>;

    /// Completed allocations created before `cutoff`.
    async fn list_completed_allocations_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PodAllocation>>;

    async fn update_allocation_status(
        &self,
        allocation_id: i64,
        status: AllocationStatus,
        message: Option<&str>,
    ) -> Result<()>;

    async fn update_allocation_pid(&self, allocation_id: i64, pid: i32) -> Result<()>;

    /// Returns false if the row did not exist.
    async fn delete_allocation(&self, allocation_id: i64) -> Result<bool>;

    // ===== Execution runs =====

    async fn create_run(&self, study_id: i64) -> Result<ExecutionRun>;

    async fn get_run(&self, run_id: i64) -> Result<Option<ExecutionRun>>;

    /// Move a run from `pending` to `running`. Returns false if it was not pending.
    async fn mark_run_running(&self, run_id: i64) -> Result<bool>;

    /// Set a terminal status only if the run is still `running`.
    ///
    /// Returns true if the update was applied. A run stopped in the meantime
    /// keeps its `stopped` status.
    async fn complete_run_if_running(
        &self,
        run_id: i64,
        status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool>;

    /// Set `stopped` only if the run is `pending` or `running`.
    async fn stop_run_if_active(&self, run_id: i64, message: Option<&str>) -> Result<bool>;

    /// Mark a pending run as failed before it ever ran.
    async fn fail_pending_run(&self, run_id: i64, message: &str) -> Result<bool>;

    async fn update_run_usage(&self, run_id: i64, cpu: f64, memory_mb: f64) -> Result<()>;

    // ===== Sub-unit statuses =====

    /// Upsert a batch of sub-unit statuses in one write.
    async fn upsert_sub_unit_statuses(&self, run_id: i64, statuses: &[SubUnitStatus])
    -> Result<()>;

    async fn list_sub_unit_statuses(&self, run_id: i64) -> Result<Vec<SubUnitStatus>>;
}
