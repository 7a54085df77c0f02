// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Study Manager Cache
//!
//! Holds at most one live in-memory manager per study and hands out consistent
//! snapshots of it to concurrent requests.
//!
//! Each study has a [`CacheEntry`] with its own mutex. The map lock is only
//! taken to insert or remove entries; loads and reloads happen under the entry
//! mutex, so two requests for the same study never load it twice while requests
//! for different studies proceed independently.
//!
//! Handles are immutable. A reload builds a new [`StudyManager`] and swaps it in
//! under the entry mutex; callers holding the old `Arc` keep a coherent (if
//! outdated) view.
//!
//! ```text
//!   get(id) ──► entry lock ──► cold or stale? ──yes──► loader (blocking thread)
//!                   │                                      │
//!                   │ no                                   ▼
//!                   ▼                          release old engine, publish new
//!              current handle ◄────────────────────────────┘
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::{StudyEngine, StudyLoader};
use crate::error::{Error, Result};
use crate::persistence::Persistence;

/// Load state of a study handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    /// Nothing loaded.
    None,
    /// A load or reload is running.
    InProgress,
    /// Loaded from a read-only snapshot.
    ReadOnly,
    /// Loaded and writable.
    Loaded,
    /// The last load failed.
    InError,
}

impl LoadStatus {
    fn to_u8(self) -> u8 {
        match self {
            LoadStatus::None => 0,
            LoadStatus::InProgress => 1,
            LoadStatus::ReadOnly => 2,
            LoadStatus::Loaded => 3,
            LoadStatus::InError => 4,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => LoadStatus::InProgress,
            2 => LoadStatus::ReadOnly,
            3 => LoadStatus::Loaded,
            4 => LoadStatus::InError,
            _ => LoadStatus::None,
        }
    }
}

/// Immutable snapshot of a study's in-memory state.
pub struct StudyManager {
    /// Study ID.
    pub study_id: i64,
    /// Authoritative modification timestamp this handle was loaded at.
    pub modified_at: DateTime<Utc>,
    /// Load state.
    pub status: LoadStatus,
    /// Load error, when `status` is `InError`.
    pub error: Option<String>,
    /// Loaded engine, when `status` is `Loaded` or `ReadOnly`.
    pub engine: Option<Arc<dyn StudyEngine>>,
}

impl StudyManager {
    fn empty(study_id: i64) -> Self {
        Self {
            study_id,
            modified_at: DateTime::<Utc>::MIN_UTC,
            status: LoadStatus::None,
            error: None,
            engine: None,
        }
    }

    /// Whether the handle carries an engine.
    pub fn is_loaded(&self) -> bool {
        self.engine.is_some()
    }
}

impl std::fmt::Debug for StudyManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StudyManager")
            .field("study_id", &self.study_id)
            .field("modified_at", &self.modified_at)
            .field("status", &self.status)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

/// Cache slot for one study.
pub struct CacheEntry {
    handle: Arc<Mutex<Arc<StudyManager>>>,
    loading: AtomicBool,
    status: AtomicU8,
}

impl CacheEntry {
    fn new(study_id: i64) -> Self {
        Self {
            handle: Arc::new(Mutex::new(Arc::new(StudyManager::empty(study_id)))),
            loading: AtomicBool::new(false),
            status: AtomicU8::new(LoadStatus::None.to_u8()),
        }
    }

    fn status(&self) -> LoadStatus {
        if self.loading.load(Ordering::SeqCst) {
            LoadStatus::InProgress
        } else {
            LoadStatus::from_u8(self.status.load(Ordering::SeqCst))
        }
    }
}

/// Exclusive access to one study's handle.
///
/// The entry mutex is held until this guard is released or dropped.
pub struct LockedStudy {
    guard: OwnedMutexGuard<Arc<StudyManager>>,
}

impl LockedStudy {
    /// The handle published at lock time.
    pub fn handle(&self) -> Arc<StudyManager> {
        Arc::clone(&self.guard)
    }

    /// Release the entry mutex.
    pub fn release(self) {
        drop(self);
    }
}

impl std::ops::Deref for LockedStudy {
    type Target = StudyManager;

    fn deref(&self) -> &StudyManager {
        &self.guard
    }
}

/// Cache settings.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Minimum interval between two last-activity writes for one study.
    pub activity_flush_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            activity_flush_interval: Duration::from_secs(5),
        }
    }
}

/// Concurrency-safe cache of study managers.
pub struct StudyManagerCache {
    persistence: Arc<dyn Persistence>,
    loader: Arc<dyn StudyLoader>,
    config: CacheConfig,
    entries: DashMap<i64, Arc<CacheEntry>>,
    last_touch: DashMap<i64, Instant>,
}

impl StudyManagerCache {
    /// Create an empty cache.
    pub fn new(
        persistence: Arc<dyn Persistence>,
        loader: Arc<dyn StudyLoader>,
        config: CacheConfig,
    ) -> Self {
        Self {
            persistence,
            loader,
            config,
            entries: DashMap::new(),
            last_touch: DashMap::new(),
        }
    }

    /// Get a consistent snapshot of a study's manager.
    ///
    /// Loads the study on first access. With `check_staleness`, the study is
    /// reloaded if the authoritative modification timestamp moved past the
    /// cached one. Load failures produce an `InError` handle, not an error.
    pub async fn get(&self, study_id: i64, check_staleness: bool) -> Result<Arc<StudyManager>> {
        let locked = self.get_locked(study_id, check_staleness).await?;
        Ok(locked.handle())
    }

    /// Like [`get`](Self::get), but keeps the study's entry locked until the
    /// returned guard is released.
    pub async fn get_locked(&self, study_id: i64, check_staleness: bool) -> Result<LockedStudy> {
        let (entry, mut guard) = loop {
            let entry = self.entry(study_id);
            let guard = entry.handle.clone().lock_owned().await;
            // An eviction may have detached the entry while we waited
            if self.is_current(study_id, &entry) {
                break (entry, guard);
            }
        };

        let cold = guard.status == LoadStatus::None;
        if cold || check_staleness {
            let Some(authoritative) = self.persistence.get_study_modified_at(study_id).await?
            else {
                drop(guard);
                self.remove_entry(study_id, &entry).await;
                return Err(Error::StudyNotFound(study_id));
            };

            if cold || authoritative > guard.modified_at {
                if !cold {
                    info!(
                        study_id = study_id,
                        cached = %guard.modified_at,
                        authoritative = %authoritative,
                        "Study is stale, reloading"
                    );
                }
                self.load(study_id, &entry, &mut guard, authoritative).await;
            } else if authoritative < guard.modified_at {
                warn!(
                    study_id = study_id,
                    cached = %guard.modified_at,
                    authoritative = %authoritative,
                    "Authoritative timestamp is older than cached one"
                );
            }
        }

        Ok(LockedStudy { guard })
    }

    /// Release a locked study.
    pub fn release(&self, locked: LockedStudy) {
        locked.release();
    }

    /// Get or create the entry for a study.
    fn entry(&self, study_id: i64) -> Arc<CacheEntry> {
        self.entries
            .entry(study_id)
            .or_insert_with(|| Arc::new(CacheEntry::new(study_id)))
            .clone()
    }

    fn is_current(&self, study_id: i64, entry: &Arc<CacheEntry>) -> bool {
        self.entries
            .get(&study_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), entry))
    }

    async fn remove_entry(&self, study_id: i64, entry: &Arc<CacheEntry>) {
        let removed = self
            .entries
            .remove_if(&study_id, |_, current| Arc::ptr_eq(current, entry));
        if let Some((_, entry)) = removed {
            let handle = entry.handle.lock().await.clone();
            retire(handle).await;
        }
    }

    /// Load the study and publish the new handle. Runs under the entry mutex.
    async fn load(
        &self,
        study_id: i64,
        entry: &CacheEntry,
        guard: &mut OwnedMutexGuard<Arc<StudyManager>>,
        authoritative: DateTime<Utc>,
    ) {
        entry.loading.store(true, Ordering::SeqCst);
        let started = Instant::now();

        let loader = self.loader.clone();
        let result = tokio::task::spawn_blocking(move || loader.load(study_id)).await;

        let handle = match result {
            Ok(Ok(loaded)) => StudyManager {
                study_id,
                modified_at: authoritative,
                status: if loaded.read_only {
                    LoadStatus::ReadOnly
                } else {
                    LoadStatus::Loaded
                },
                error: None,
                engine: Some(loaded.engine),
            },
            Ok(Err(e)) => {
                warn!(study_id = study_id, error = %e, "Study load failed");
                StudyManager {
                    error: Some(e.to_string()),
                    ..failed_handle(study_id, authoritative)
                }
            }
            Err(e) => {
                warn!(study_id = study_id, error = %e, "Study loader panicked");
                StudyManager {
                    error: Some(format!("loader panicked: {e}")),
                    ..failed_handle(study_id, authoritative)
                }
            }
        };

        let status = handle.status;
        let previous = std::mem::replace(&mut **guard, Arc::new(handle));
        retire(previous).await;

        entry.status.store(status.to_u8(), Ordering::SeqCst);
        entry.loading.store(false, Ordering::SeqCst);

        debug!(
            study_id = study_id,
            status = ?status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Published study handle"
        );
    }

    /// Load status of a study without waiting for its entry lock.
    pub fn peek_status(&self, study_id: i64) -> LoadStatus {
        self.entries
            .get(&study_id)
            .map(|entry| entry.status())
            .unwrap_or(LoadStatus::None)
    }

    /// Drop a study from the cache and release its engine.
    ///
    /// Waits for an in-flight load of the study to finish first.
    pub async fn evict(&self, study_id: i64) -> bool {
        self.last_touch.remove(&study_id);
        let Some((_, entry)) = self.entries.remove(&study_id) else {
            return false;
        };

        let handle = {
            let mut guard = entry.handle.lock().await;
            std::mem::replace(&mut *guard, Arc::new(StudyManager::empty(study_id)))
        };
        retire(handle).await;

        info!(study_id = study_id, "Evicted study from cache");
        true
    }

    /// Record activity on a study, coalescing writes.
    ///
    /// Returns whether a write was issued.
    pub async fn touch_last_active(&self, study_id: i64) -> Result<bool> {
        let now = Instant::now();
        let due = match self.last_touch.entry(study_id) {
            Entry::Occupied(mut last) => {
                if now.duration_since(*last.get()) >= self.config.activity_flush_interval {
                    last.insert(now);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(slot) => {
                slot.insert(now);
                true
            }
        };

        if !due {
            return Ok(false);
        }

        if let Err(e) = self
            .persistence
            .touch_study_last_active(study_id, Utc::now())
            .await
        {
            self.last_touch.remove(&study_id);
            return Err(e);
        }
        Ok(true)
    }

    /// IDs of the studies currently resident.
    pub fn cached_ids(&self) -> Vec<i64> {
        let mut ids: Vec<i64> = self.entries.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Evict every study. Used on shutdown.
    pub async fn clear(&self) {
        for study_id in self.cached_ids() {
            self.evict(study_id).await;
        }
    }
}

fn failed_handle(study_id: i64, modified_at: DateTime<Utc>) -> StudyManager {
    StudyManager {
        study_id,
        modified_at,
        status: LoadStatus::InError,
        error: None,
        engine: None,
    }
}

/// Release the engine of a retired handle on a blocking thread.
async fn retire(handle: Arc<StudyManager>) {
    let Some(engine) = handle.engine.clone() else {
        return;
    };
    let study_id = handle.study_id;
    if let Err(e) = tokio::task::spawn_blocking(move || engine.release()).await {
        warn!(study_id = study_id, error = %e, "Engine release panicked");
    }
}
