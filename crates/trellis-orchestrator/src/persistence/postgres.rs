// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence backend.
//!
//! Statuses are stored as text. Run completion uses guarded updates
//! (`WHERE status = 'running'`) so a terminal status is never overwritten.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};

use super::{NewAllocation, Persistence, SubUnitStatus};
use crate::allocation::{AllocationKind, AllocationStatus, PodAllocation};
use crate::error::{Error, Result};
use crate::supervisor::{ExecutionRun, RunStatus};

/// PostgreSQL-backed persistence implementation.
#[derive(Clone)]
pub struct PostgresPersistence {
    pool: PgPool,
}

impl PostgresPersistence {
    /// Create a new Postgres-backed persistence implementation.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get the underlying pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ============================================================================
// Record Types
// ============================================================================

#[derive(Debug, sqlx::FromRow)]
struct AllocationRow {
    id: i64,
    identifier: i64,
    kind: String,
    flavor: String,
    strategy: String,
    pod_name: String,
    namespace: String,
    status: String,
    message: Option<String>,
    pid: Option<i32>,
    created_at: DateTime<Utc>,
}

impl TryFrom<AllocationRow> for PodAllocation {
    type Error = Error;

    fn try_from(row: AllocationRow) -> Result<Self> {
        Ok(PodAllocation {
            id: row.id,
            identifier: row.identifier,
            kind: row.kind.parse()?,
            flavor: row.flavor,
            strategy: row.strategy.parse()?,
            pod_name: row.pod_name,
            namespace: row.namespace,
            status: row.status.parse()?,
            message: row.message,
            pid: row.pid,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct RunRow {
    id: i64,
    study_id: i64,
    status: String,
    message: Option<String>,
    cpu_usage: Option<f64>,
    memory_usage: Option<f64>,
    created_at: DateTime<Utc>,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl TryFrom<RunRow> for ExecutionRun {
    type Error = Error;

    fn try_from(row: RunRow) -> Result<Self> {
        Ok(ExecutionRun {
            id: row.id,
            study_id: row.study_id,
            status: row.status.parse()?,
            message: row.message,
            cpu_usage: row.cpu_usage,
            memory_usage: row.memory_usage,
            created_at: row.created_at,
            started_at: row.started_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct SubUnitRow {
    sub_unit_id: String,
    status: String,
    updated_at: DateTime<Utc>,
}

const ALLOCATION_COLUMNS: &str = "id, identifier, kind, flavor, strategy, pod_name, namespace, \
     status, message, pid, created_at";

const RUN_COLUMNS: &str = "id, study_id, status, message, cpu_usage, memory_usage, \
     created_at, started_at, finished_at";

fn into_allocations(rows: Vec<AllocationRow>) -> Result<Vec<PodAllocation>> {
    rows.into_iter().map(PodAllocation::try_from).collect()
}

// ============================================================================
// Study Operations
// ============================================================================

/// Get the modification timestamp of a study.
pub async fn get_study_modified_at(pool: &PgPool, study_id: i64) -> Result<Option<DateTime<Utc>>> {
    let row: Option<(DateTime<Utc>,)> =
        sqlx::query_as("SELECT modified_at FROM studies WHERE id = $1")
            .bind(study_id)
            .fetch_optional(pool)
            .await?;
    Ok(row.map(|(modified_at,)| modified_at))
}

/// Set the modification timestamp of a study.
pub async fn set_study_modified_at(
    pool: &PgPool,
    study_id: i64,
    modified_at: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query("UPDATE studies SET modified_at = $2 WHERE id = $1")
        .bind(study_id)
        .bind(modified_at)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::StudyNotFound(study_id));
    }
    Ok(())
}

/// Record study activity.
pub async fn touch_study_last_active(
    pool: &PgPool,
    study_id: i64,
    at: DateTime<Utc>,
) -> Result<()> {
    let result = sqlx::query("UPDATE studies SET last_active_at = $2 WHERE id = $1")
        .bind(study_id)
        .bind(at)
        .execute(pool)
        .await?;

    if result.rows_affected() == 0 {
        return Err(Error::StudyNotFound(study_id));
    }
    Ok(())
}

// ============================================================================
// Allocation Operations
// ============================================================================

/// Insert an allocation row.
pub async fn insert_allocation(pool: &PgPool, allocation: &NewAllocation) -> Result<PodAllocation> {
    let row = sqlx::query_as::<_, AllocationRow>(&format!(
        r#"
        INSERT INTO pod_allocations (identifier, kind, flavor, strategy, pod_name, namespace, status)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        RETURNING {ALLOCATION_COLUMNS}
        "#
    ))
    .bind(allocation.identifier)
    .bind(allocation.kind.as_str())
    .bind(&allocation.flavor)
    .bind(allocation.strategy.as_str())
    .bind(&allocation.pod_name)
    .bind(&allocation.namespace)
    .bind(allocation.status.as_str())
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Get an allocation by ID.
pub async fn get_allocation(pool: &PgPool, allocation_id: i64) -> Result<Option<PodAllocation>> {
    let row = sqlx::query_as::<_, AllocationRow>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM pod_allocations WHERE id = $1"
    ))
    .bind(allocation_id)
    .fetch_optional(pool)
    .await?;

    row.map(PodAllocation::try_from).transpose()
}

/// List non-terminal allocations for (identifier, kind), newest first.
pub async fn list_active_allocations(
    pool: &PgPool,
    identifier: i64,
    kind: AllocationKind,
) -> Result<Vec<PodAllocation>> {
    let rows = sqlx::query_as::<_, AllocationRow>(&format!(
        r#"
        SELECT {ALLOCATION_COLUMNS}
        FROM pod_allocations
        WHERE identifier = $1
          AND kind = $2
          AND status IN ('not_started', 'pending', 'running')
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(identifier)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    into_allocations(rows)
}

/// List terminal allocations for an identifier and kind, newest first.
pub async fn list_terminal_allocations(
    pool: &PgPool,
    identifier: i64,
    kind: AllocationKind,
) -> Result<Vec<PodAllocation>> {
    let rows = sqlx::query_as::<_, AllocationRow>(&format!(
        r#"
        SELECT {ALLOCATION_COLUMNS}
        FROM pod_allocations
        WHERE identifier = $1
          AND kind = $2
          AND status IN ('completed', 'in_error', 'oom_killed')
        ORDER BY created_at DESC, id DESC
        "#
    ))
    .bind(identifier)
    .bind(kind.as_str())
    .fetch_all(pool)
    .await?;

    into_allocations(rows)
}

/// List every allocation that is not completed.
pub async fn list_unfinished_allocations(pool: &PgPool) -> Result<Vec<PodAllocation>> {
    let rows = sqlx::query_as::<_, AllocationRow>(&format!(
        "SELECT {ALLOCATION_COLUMNS} FROM pod_allocations WHERE status <> 'completed' ORDER BY id"
    ))
    .fetch_all(pool)
    .await?;

    into_allocations(rows)
}

/// List completed allocations created before a cutoff.
pub async fn list_completed_allocations_before(
    pool: &PgPool,
    cutoff: DateTime<Utc>,
) -> Result<Vec<PodAllocation>> {
    let rows = sqlx::query_as::<_, AllocationRow>(&format!(
        r#"
        SELECT {ALLOCATION_COLUMNS}
        FROM pod_allocations
        WHERE status = 'completed' AND created_at < $1
        ORDER BY id
        "#
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    into_allocations(rows)
}

/// Update allocation status and message.
pub async fn update_allocation_status(
    pool: &PgPool,
    allocation_id: i64,
    status: AllocationStatus,
    message: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE pod_allocations SET status = $2, message = $3 WHERE id = $1")
        .bind(allocation_id)
        .bind(status.as_str())
        .bind(message)
        .execute(pool)
        .await?;
    Ok(())
}

/// Record the worker PID of a subprocess allocation.
pub async fn update_allocation_pid(pool: &PgPool, allocation_id: i64, pid: i32) -> Result<()> {
    sqlx::query("UPDATE pod_allocations SET pid = $2 WHERE id = $1")
        .bind(allocation_id)
        .bind(pid)
        .execute(pool)
        .await?;
    Ok(())
}

/// Delete an allocation row. Returns false if it did not exist.
pub async fn delete_allocation(pool: &PgPool, allocation_id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM pod_allocations WHERE id = $1")
        .bind(allocation_id)
        .execute(pool)
        .await?;
    Ok(result.rows_affected() > 0)
}

// ============================================================================
// Execution Run Operations
// ============================================================================

/// Create a pending run.
pub async fn create_run(pool: &PgPool, study_id: i64) -> Result<ExecutionRun> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        r#"
        INSERT INTO execution_runs (study_id, status)
        VALUES ($1, 'pending')
        RETURNING {RUN_COLUMNS}
        "#
    ))
    .bind(study_id)
    .fetch_one(pool)
    .await?;

    row.try_into()
}

/// Get a run by ID.
pub async fn get_run(pool: &PgPool, run_id: i64) -> Result<Option<ExecutionRun>> {
    let row = sqlx::query_as::<_, RunRow>(&format!(
        "SELECT {RUN_COLUMNS} FROM execution_runs WHERE id = $1"
    ))
    .bind(run_id)
    .fetch_optional(pool)
    .await?;

    row.map(ExecutionRun::try_from).transpose()
}

/// Move a pending run to running.
pub async fn mark_run_running(pool: &PgPool, run_id: i64) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE execution_runs
        SET status = 'running', started_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Set a terminal status only if the run is still running.
pub async fn complete_run_if_running(
    pool: &PgPool,
    run_id: i64,
    status: RunStatus,
    message: Option<&str>,
) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE execution_runs
        SET status = $2, message = $3, finished_at = NOW()
        WHERE id = $1 AND status = 'running'
        "#,
    )
    .bind(run_id)
    .bind(status.as_str())
    .bind(message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Stop a pending or running run.
pub async fn stop_run_if_active(pool: &PgPool, run_id: i64, message: Option<&str>) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE execution_runs
        SET status = 'stopped', message = $2, finished_at = NOW()
        WHERE id = $1 AND status IN ('pending', 'running')
        "#,
    )
    .bind(run_id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Fail a run that never started.
pub async fn fail_pending_run(pool: &PgPool, run_id: i64, message: &str) -> Result<bool> {
    let result = sqlx::query(
        r#"
        UPDATE execution_runs
        SET status = 'failed', message = $2, finished_at = NOW()
        WHERE id = $1 AND status = 'pending'
        "#,
    )
    .bind(run_id)
    .bind(message)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Record the latest resource usage sample of a run.
pub async fn update_run_usage(pool: &PgPool, run_id: i64, cpu: f64, memory_mb: f64) -> Result<()> {
    sqlx::query("UPDATE execution_runs SET cpu_usage = $2, memory_usage = $3 WHERE id = $1")
        .bind(run_id)
        .bind(cpu)
        .bind(memory_mb)
        .execute(pool)
        .await?;
    Ok(())
}

// ============================================================================
// Sub-unit Status Operations
// ============================================================================

/// Upsert a batch of sub-unit statuses in a single statement.
///
/// Sub-unit IDs within one batch must be unique.
pub async fn upsert_sub_unit_statuses(
    pool: &PgPool,
    run_id: i64,
    statuses: &[SubUnitStatus],
) -> Result<()> {
    if statuses.is_empty() {
        return Ok(());
    }

    let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
        "INSERT INTO sub_unit_statuses (run_id, sub_unit_id, status, updated_at) ",
    );
    builder.push_values(statuses, |mut row, status| {
        row.push_bind(run_id)
            .push_bind(status.sub_unit_id.clone())
            .push_bind(status.status.clone())
            .push_bind(status.updated_at);
    });
    builder.push(
        " ON CONFLICT (run_id, sub_unit_id) DO UPDATE \
         SET status = EXCLUDED.status, updated_at = EXCLUDED.updated_at",
    );

    builder.build().execute(pool).await?;
    Ok(())
}

/// List the statuses of every sub-unit of a run.
pub async fn list_sub_unit_statuses(pool: &PgPool, run_id: i64) -> Result<Vec<SubUnitStatus>> {
    let rows = sqlx::query_as::<_, SubUnitRow>(
        r#"
        SELECT sub_unit_id, status, updated_at
        FROM sub_unit_statuses
        WHERE run_id = $1
        ORDER BY sub_unit_id
        "#,
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;

    Ok(rows
        .into_iter()
        .map(|row| SubUnitStatus {
            sub_unit_id: row.sub_unit_id,
            status: row.status,
            updated_at: row.updated_at,
        })
        .collect())
}

#[async_trait]
impl Persistence for PostgresPersistence {
    async fn get_study_modified_at(&self, study_id: i64) -> Result<Option<DateTime<Utc>>> {
        get_study_modified_at(&self.pool, study_id).await
    }

    async fn set_study_modified_at(
        &self,
        study_id: i64,
        modified_at: DateTime<Utc>,
    ) -> Result<()> {
        set_study_modified_at(&self.pool, study_id, modified_at).await
    }

    async fn touch_study_last_active(&self, study_id: i64, at: DateTime<Utc>) -> Result<()> {
        touch_study_last_active(&self.pool, study_id, at).await
    }

    async fn insert_allocation(&self, allocation: &NewAllocation) -> Result<PodAllocation> {
        insert_allocation(&self.pool, allocation).await
    }

    async fn get_allocation(&self, allocation_id: i64) -> Result<Option<PodAllocation>> {
        get_allocation(&self.pool, allocation_id).await
    }

    async fn list_active_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>> {
        list_active_allocations(&self.pool, identifier, kind).await
    }

    async fn list_terminal_allocations(
        &self,
        identifier: i64,
        kind: AllocationKind,
    ) -> Result<Vec<PodAllocation>> {
        list_terminal_allocations(&self.pool, identifier, kind).await
    }

    async fn list_unfinished_allocations(&self) -> Result<Vec<PodAllocation>> {
        list_unfinished_allocations(&self.pool).await
    }

    async fn list_completed_allocations_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PodAllocation>> {
        list_completed_allocations_before(&self.pool, cutoff).await
    }

    async fn update_allocation_status(
        &self,
        allocation_id: i64,
        status: AllocationStatus,
        message: Option<&str>,
    ) -> Result<()> {
        update_allocation_status(&self.pool, allocation_id, status, message).await
    }

    async fn update_allocation_pid(&self, allocation_id: i64, pid: i32) -> Result<()> {
        update_allocation_pid(&self.pool, allocation_id, pid).await
    }

    async fn delete_allocation(&self, allocation_id: i64) -> Result<bool> {
        delete_allocation(&self.pool, allocation_id).await
    }

    async fn create_run(&self, study_id: i64) -> Result<ExecutionRun> {
        create_run(&self.pool, study_id).await
    }

    async fn get_run(&self, run_id: i64) -> Result<Option<ExecutionRun>> {
        get_run(&self.pool, run_id).await
    }

    async fn mark_run_running(&self, run_id: i64) -> Result<bool> {
        mark_run_running(&self.pool, run_id).await
    }

    async fn complete_run_if_running(
        &self,
        run_id: i64,
        status: RunStatus,
        message: Option<&str>,
    ) -> Result<bool> {
        complete_run_if_running(&self.pool, run_id, status, message).await
    }

    async fn stop_run_if_active(&self, run_id: i64, message: Option<&str>) -> Result<bool> {
        stop_run_if_active(&self.pool, run_id, message).await
    }

    async fn fail_pending_run(&self, run_id: i64, message: &str) -> Result<bool> {
        fail_pending_run(&self.pool, run_id, message).await
    }

    async fn update_run_usage(&self, run_id: i64, cpu: f64, memory_mb: f64) -> Result<()> {
        update_run_usage(&self.pool, run_id, cpu, memory_mb).await
    }

    async fn upsert_sub_unit_statuses(
        &self,
        run_id: i64,
        statuses: &[SubUnitStatus],
    ) -> Result<()> {
        upsert_sub_unit_statuses(&self.pool, run_id, statuses).await
    }

    async fn list_sub_unit_statuses(&self, run_id: i64) -> Result<Vec<SubUnitStatus>> {
        list_sub_unit_statuses(&self.pool, run_id).await
    }
}
