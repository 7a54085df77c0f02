// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Trellis Orchestrator - Study Orchestration Core
//!
//! This crate runs long-lived study computations on interchangeable backends
//! (an in-process thread, an OS subprocess, or a container-orchestrator pod),
//! tracks them to completion, and exposes loaded studies to concurrent requests
//! without corrupting in-memory state.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     Request handlers (embedding app)                    │
//! └─────────────────────────────────────────────────────────────────────────┘
//!            │ get / get_locked                    │ submit / stop
//!            ▼                                     ▼
//! ┌─────────────────────┐            ┌──────────────────────────┐
//! │ Study Manager Cache │───handle──►│   Execution Supervisor   │
//! └─────────────────────┘            └──────────────────────────┘
//!            │ load                       │ allocate     │ run + observe
//!            ▼                            ▼              ▼
//! ┌─────────────────────┐   ┌──────────────────────┐  ┌────────────────────┐
//! │   Study loader /    │   │ Resource Allocation  │  │ Status Pipeline +  │
//! │   engine (external) │   │      Manager         │  │  Metrics Sampler   │
//! └─────────────────────┘   └──────────────────────┘  └────────────────────┘
//!                              │ pods      │ rows            │ batched rows
//!                              ▼           ▼                 ▼
//!                    ┌──────────────┐ ┌───────────────────────────────────┐
//!                    │ Orchestrator │ │            PostgreSQL             │
//!                    └──────────────┘ └───────────────────────────────────┘
//! ```
//!
//! # Execution Strategies
//!
//! | Strategy | Sessions | Batch (execution, reference generation) |
//! |----------|----------|------------------------------------------|
//! | `thread` | in-process | computation on a blocking thread |
//! | `subprocess` | worker process | worker process, stopped with SIGTERM |
//! | `orchestrator` | pod + service | pod, deleted on stop |
//!
//! # Configuration
//!
//! | Variable | Required | Default | Description |
//! |----------|----------|---------|-------------|
//! | `TRELLIS_DATABASE_URL` | Yes (binary) | - | PostgreSQL connection string |
//! | `TRELLIS_SESSION_STRATEGY` | No | `thread` | Strategy for study sessions |
//! | `TRELLIS_BATCH_STRATEGY` | No | `thread` | Strategy for batch workloads |
//! | `TRELLIS_FLAVOR_CATALOG` | With `orchestrator` | - | Inline JSON flavor catalog |
//! | `TRELLIS_FLAVOR_CATALOG_PATH` | With `orchestrator` | - | Path to the flavor catalog |
//! | `TRELLIS_NAMESPACE` | No | `default` | Orchestrator namespace |
//! | `TRELLIS_WORKER_IMAGE` | No | `trellis-worker:latest` | Worker pod image |
//! | `TRELLIS_SUBPROCESS_COMMAND` | No | `trellis-worker` | Worker command line |
//!
//! # Modules
//!
//! - [`allocation`]: Resource allocation state machine
//! - [`cache`]: Study manager cache
//! - [`supervisor`]: Execution run lifecycle
//! - [`pipeline`]: Batched sub-unit status propagation
//! - [`metrics`]: Resource usage sampling
//! - [`persistence`]: Persistence trait and backends
//! - [`orchestrator`]: Container orchestrator clients

#![deny(missing_docs)]

/// Database migrations for trellis-orchestrator.
pub mod migrations;

/// Configuration loaded from environment variables.
pub mod config;

/// Error types for orchestration operations.
pub mod error;

/// Memory and CPU quantity parsing and conversion.
pub mod units;

/// Scientific engine interface.
pub mod engine;

/// Container orchestrator clients.
pub mod orchestrator;

/// OS process backend for the subprocess strategy.
pub mod process;

/// Persistence interfaces and backends.
pub mod persistence;

/// Resource allocation manager.
pub mod allocation;

/// Status propagation pipeline.
pub mod pipeline;

/// Resource usage sampling.
pub mod metrics;

/// Execution supervisor.
pub mod supervisor;

/// Study manager cache.
pub mod cache;

/// Background worker reconciling allocation statuses.
pub mod reconcile_worker;

/// Embeddable runtime for trellis-orchestrator.
pub mod runtime;

pub use config::Config;
pub use error::Error;
