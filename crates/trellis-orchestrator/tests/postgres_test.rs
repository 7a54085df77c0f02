// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL persistence tests for trellis-orchestrator.
//!
//! These tests verify the guarded run updates, allocation queries and batched
//! status upserts against a real database.

mod common;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use trellis_orchestrator::allocation::{AllocationKind, AllocationStatus};
use trellis_orchestrator::config::ExecutionStrategy;
use trellis_orchestrator::migrations;
use trellis_orchestrator::persistence::{
    NewAllocation, Persistence, PostgresPersistence, SubUnitStatus,
};
use trellis_orchestrator::supervisor::RunStatus;

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_TRELLIS_DATABASE_URL").is_err()
            && std::env::var("TRELLIS_DATABASE_URL").is_err()
        {
            eprintln!("Skipping test: TEST_TRELLIS_DATABASE_URL or TRELLIS_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_pool() -> Option<PgPool> {
    let database_url = std::env::var("TEST_TRELLIS_DATABASE_URL")
        .or_else(|_| std::env::var("TRELLIS_DATABASE_URL"))
        .ok()?;
    let pool = PgPool::connect(&database_url).await.ok()?;
    migrations::run(&pool).await.expect("Failed to run migrations");
    Some(pool)
}

async fn create_study(pool: &PgPool, modified_at: DateTime<Utc>) -> i64 {
    sqlx::query_scalar("INSERT INTO studies (modified_at) VALUES ($1) RETURNING id")
        .bind(modified_at)
        .fetch_one(pool)
        .await
        .expect("Failed to create study")
}

/// Identifier unlikely to collide with rows left by earlier runs.
fn unique_identifier() -> i64 {
    (uuid::Uuid::new_v4().as_u128() as i64).abs()
}

fn new_allocation(identifier: i64, kind: AllocationKind, status: AllocationStatus) -> NewAllocation {
    NewAllocation {
        identifier,
        kind,
        flavor: "small".to_string(),
        strategy: ExecutionStrategy::Orchestrator,
        pod_name: format!("{}-{}", kind.name_prefix(), identifier),
        namespace: "trellis-test".to_string(),
        status,
    }
}

fn status(sub_unit_id: &str, status: &str) -> SubUnitStatus {
    SubUnitStatus {
        sub_unit_id: sub_unit_id.to_string(),
        status: status.to_string(),
        updated_at: Utc::now(),
    }
}

// ============================================================================
// Studies
// ============================================================================

#[tokio::test]
async fn test_study_timestamps() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool.clone());

    let modified = Utc::now();
    let study_id = create_study(&pool, modified).await;

    let read = persistence
        .get_study_modified_at(study_id)
        .await
        .unwrap()
        .unwrap();
    // TIMESTAMPTZ keeps microseconds
    assert_eq!(read.timestamp_micros(), modified.timestamp_micros());

    let later = modified + chrono::Duration::seconds(5);
    persistence
        .set_study_modified_at(study_id, later)
        .await
        .unwrap();
    let read = persistence
        .get_study_modified_at(study_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(read.timestamp_micros(), later.timestamp_micros());

    persistence
        .touch_study_last_active(study_id, Utc::now())
        .await
        .unwrap();

    assert!(
        persistence
            .get_study_modified_at(-1)
            .await
            .unwrap()
            .is_none()
    );
    assert!(persistence.touch_study_last_active(-1, Utc::now()).await.is_err());
}

// ============================================================================
// Allocations
// ============================================================================

#[tokio::test]
async fn test_allocation_lifecycle() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool);
    let identifier = unique_identifier();

    let allocation = persistence
        .insert_allocation(&new_allocation(
            identifier,
            AllocationKind::Execution,
            AllocationStatus::NotStarted,
        ))
        .await
        .unwrap();
    assert_eq!(allocation.status, AllocationStatus::NotStarted);
    assert_eq!(allocation.strategy, ExecutionStrategy::Orchestrator);
    assert!(allocation.pid.is_none());

    persistence
        .update_allocation_status(allocation.id, AllocationStatus::OomKilled, Some("OOMKilled"))
        .await
        .unwrap();
    persistence.update_allocation_pid(allocation.id, 4242).await.unwrap();

    let stored = persistence
        .get_allocation(allocation.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, AllocationStatus::OomKilled);
    assert_eq!(stored.message.as_deref(), Some("OOMKilled"));
    assert_eq!(stored.pid, Some(4242));
    assert_eq!(stored.kind, AllocationKind::Execution);

    assert!(persistence.delete_allocation(allocation.id).await.unwrap());
    assert!(!persistence.delete_allocation(allocation.id).await.unwrap());
    assert!(persistence.get_allocation(allocation.id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_active_allocations_newest_first() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool);
    let identifier = unique_identifier();
    let kind = AllocationKind::StudySession;

    let older = persistence
        .insert_allocation(&new_allocation(identifier, kind, AllocationStatus::Running))
        .await
        .unwrap();
    let newer = persistence
        .insert_allocation(&new_allocation(identifier, kind, AllocationStatus::Pending))
        .await
        .unwrap();
    let done = persistence
        .insert_allocation(&new_allocation(identifier, kind, AllocationStatus::Completed))
        .await
        .unwrap();

    let active = persistence
        .list_active_allocations(identifier, kind)
        .await
        .unwrap();
    let ids: Vec<i64> = active.iter().map(|a| a.id).collect();
    assert_eq!(ids, vec![newer.id, older.id]);

    // Other kinds with the same identifier are separate
    assert!(
        persistence
            .list_active_allocations(identifier, AllocationKind::Execution)
            .await
            .unwrap()
            .is_empty()
    );

    let unfinished = persistence.list_unfinished_allocations().await.unwrap();
    assert!(unfinished.iter().any(|a| a.id == older.id));
    assert!(!unfinished.iter().any(|a| a.id == done.id));

    let completed = persistence
        .list_completed_allocations_before(Utc::now() + chrono::Duration::minutes(1))
        .await
        .unwrap();
    assert!(completed.iter().any(|a| a.id == done.id));

    for id in [older.id, newer.id, done.id] {
        persistence.delete_allocation(id).await.unwrap();
    }
}

// ============================================================================
// Execution runs
// ============================================================================

#[tokio::test]
async fn test_stopped_run_is_not_overwritten() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool.clone());
    let study_id = create_study(&pool, Utc::now()).await;

    let run = persistence.create_run(study_id).await.unwrap();
    assert_eq!(run.status, RunStatus::Pending);

    assert!(persistence.mark_run_running(run.id).await.unwrap());
    assert!(!persistence.mark_run_running(run.id).await.unwrap());

    assert!(
        persistence
            .stop_run_if_active(run.id, Some("stopped on request"))
            .await
            .unwrap()
    );
    assert!(
        !persistence
            .complete_run_if_running(run.id, RunStatus::Finished, None)
            .await
            .unwrap()
    );
    assert!(!persistence.stop_run_if_active(run.id, None).await.unwrap());

    let stored = persistence.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Stopped);
    assert_eq!(stored.message.as_deref(), Some("stopped on request"));
    assert!(stored.started_at.is_some());
    assert!(stored.finished_at.is_some());
}

#[tokio::test]
async fn test_run_failure_and_usage() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool.clone());
    let study_id = create_study(&pool, Utc::now()).await;

    let pending = persistence.create_run(study_id).await.unwrap();
    assert!(
        persistence
            .fail_pending_run(pending.id, "no capacity")
            .await
            .unwrap()
    );
    assert!(!persistence.mark_run_running(pending.id).await.unwrap());

    let run = persistence.create_run(study_id).await.unwrap();
    persistence.mark_run_running(run.id).await.unwrap();
    persistence.update_run_usage(run.id, 1.5, 2048.0).await.unwrap();
    assert!(
        persistence
            .complete_run_if_running(run.id, RunStatus::Failed, Some("diverged"))
            .await
            .unwrap()
    );
    assert!(!persistence.fail_pending_run(run.id, "late").await.unwrap());

    let stored = persistence.get_run(run.id).await.unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Failed);
    assert_eq!(stored.message.as_deref(), Some("diverged"));
    assert_eq!(stored.cpu_usage, Some(1.5));
    assert_eq!(stored.memory_usage, Some(2048.0));

    assert!(persistence.get_run(-1).await.unwrap().is_none());
}

// ============================================================================
// Sub-unit statuses
// ============================================================================

#[tokio::test]
async fn test_sub_unit_statuses_upsert() {
    skip_if_no_db!();
    let pool = get_pool().await.expect("Failed to connect to database");
    let persistence = PostgresPersistence::new(pool.clone());
    let study_id = create_study(&pool, Utc::now()).await;
    let run = persistence.create_run(study_id).await.unwrap();

    persistence
        .upsert_sub_unit_statuses(run.id, &[status("a", "queued"), status("b", "queued")])
        .await
        .unwrap();
    persistence
        .upsert_sub_unit_statuses(run.id, &[status("a", "done")])
        .await
        .unwrap();
    // Empty batches are a no-op
    persistence.upsert_sub_unit_statuses(run.id, &[]).await.unwrap();

    let statuses = persistence.list_sub_unit_statuses(run.id).await.unwrap();
    let pairs: Vec<(&str, &str)> = statuses
        .iter()
        .map(|s| (s.sub_unit_id.as_str(), s.status.as_str()))
        .collect();
    assert_eq!(pairs, vec![("a", "done"), ("b", "queued")]);
}
