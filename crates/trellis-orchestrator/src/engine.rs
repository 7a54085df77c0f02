// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scientific engine interface.
//!
//! The engine that actually computes a study is external. The orchestrator only
//! needs to load it, run it on a blocking thread, observe per-sub-unit status
//! changes while it runs, and ask it to persist its artifacts afterwards.
//!
//! All methods are synchronous: they are called from `spawn_blocking` threads,
//! never from async tasks.

use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use thiserror::Error;

/// Cancellation token for stopping an in-process computation.
///
/// Engines poll it between steps and return [`EngineError::Cancelled`] once set.
pub type CancelToken = Arc<AtomicBool>;

/// Errors reported by the scientific engine.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum EngineError {
    /// The study could not be loaded.
    #[error("Load failed: {0}")]
    Load(String),

    /// The computation failed.
    #[error("Run failed: {0}")]
    Run(String),

    /// The computation observed its cancel token.
    #[error("Computation cancelled")]
    Cancelled,

    /// Persisting computation artifacts failed.
    #[error("Artifact persistence failed: {0}")]
    Artifacts(String),

    /// The computation thread panicked or could not be joined.
    #[error("Computation thread failed: {0}")]
    Join(String),
}

/// Receives status changes of computation sub-units.
///
/// Called from the hot computation loop; implementations must not block on I/O.
pub trait StatusObserver: Send + Sync {
    /// A sub-unit moved to a new status.
    fn on_status_change(&self, sub_unit_id: &str, status: &str);
}

/// A loaded computation context for one study.
pub trait StudyEngine: Send + Sync {
    /// Run the computation to completion. Blocks the calling thread.
    fn run(&self, cancel: &CancelToken) -> Result<(), EngineError>;

    /// Identifiers of the sub-units whose status can be observed.
    fn sub_units(&self) -> Vec<String>;

    /// Register an observer on one sub-unit.
    fn attach_observer(&self, sub_unit_id: &str, observer: Arc<dyn StatusObserver>);

    /// Remove the observer from one sub-unit.
    fn detach_observer(&self, sub_unit_id: &str);

    /// Write final computation artifacts to durable storage.
    fn persist_artifacts(&self) -> Result<(), EngineError> {
        Ok(())
    }

    /// Release resources held by this context. Called once the handle is retired.
    fn release(&self) {}
}

/// Result of loading a study.
#[derive(Clone)]
pub struct LoadedStudy {
    /// The loaded engine.
    pub engine: Arc<dyn StudyEngine>,
    /// Whether the study was loaded from a read-only snapshot.
    pub read_only: bool,
}

impl std::fmt::Debug for LoadedStudy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LoadedStudy")
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

/// Loads engines from the authoritative store.
pub trait StudyLoader: Send + Sync {
    /// Load a study. Blocks the calling thread.
    fn load(&self, study_id: i64) -> Result<LoadedStudy, EngineError>;
}
