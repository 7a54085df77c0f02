// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Status Propagation Pipeline
//!
//! Decouples the computation thread from status persistence. The engine reports
//! sub-unit status changes through [`StatusObserver`]; the pipeline forwards them
//! over a bounded channel to a worker task that keeps the latest status per
//! sub-unit and writes them as one batch per flush window.
//!
//! ```text
//!   computation thread          worker task                 persistence
//!   ──────────────────          ───────────                 ───────────
//!   on_status_change ──event──► latest[sub_unit] = status
//!   on_status_change ──event──► latest[sub_unit] = status
//!                               window elapsed ───────────► upsert(batch)
//!   stop() ────────────stop───► final flush ──────────────► upsert(batch)
//! ```
//!
//! Within a window, only the last status of each sub-unit is written. A failed
//! write keeps the batch; it is merged with newer events and retried on the
//! next window.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::engine::StatusObserver;
use crate::persistence::{Persistence, SubUnitStatus};

/// Default channel capacity.
pub const DEFAULT_CAPACITY: usize = 32_768;

/// Pipeline settings.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Time between the first buffered event and the flush of its window.
    pub flush_interval: Duration,
    /// Number of events the channel holds before senders block.
    pub capacity: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(2),
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// One observed status change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressEvent {
    /// Sub-unit identifier.
    pub sub_unit_id: String,
    /// New status.
    pub status: String,
    /// When the change was observed.
    pub observed_at: DateTime<Utc>,
}

enum Command {
    Event(ProgressEvent),
    Flush(oneshot::Sender<()>),
    Stop,
}

/// Batched, asynchronous status writer for one execution run.
pub struct StatusPipeline {
    run_id: i64,
    sender: mpsc::Sender<Command>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPipeline {
    /// Start the pipeline worker for a run.
    pub fn start(
        persistence: Arc<dyn Persistence>,
        run_id: i64,
        config: PipelineConfig,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let worker = tokio::spawn(run_worker(
            persistence,
            run_id,
            config.flush_interval,
            receiver,
        ));

        debug!(run_id = run_id, "Status pipeline started");

        Arc::new(Self {
            run_id,
            sender,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Run this pipeline writes statuses for.
    pub fn run_id(&self) -> i64 {
        self.run_id
    }

    /// Enqueue a status change.
    ///
    /// Never blocks while the channel has room. When it is full, the caller is
    /// blocked until the worker catches up. On a multi-thread runtime this is
    /// safe from async tasks too; on a current-thread runtime it must be called
    /// from a blocking thread (as the engine does).
    pub fn publish(&self, event: ProgressEvent) {
        match self.sender.try_send(Command::Event(event)) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(command)) => self.publish_blocking(command),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                warn!(run_id = self.run_id, "Status pipeline closed, dropping event");
            }
        }
    }

    fn publish_blocking(&self, command: Command) {
        let sent = match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| self.sender.blocking_send(command))
            }
            _ => self.sender.blocking_send(command),
        };
        if sent.is_err() {
            warn!(run_id = self.run_id, "Status pipeline closed, dropping event");
        }
    }

    /// Force a flush of everything enqueued so far and wait for it.
    pub async fn flush(&self) {
        let (ack, done) = oneshot::channel();
        if self.sender.send(Command::Flush(ack)).await.is_err() {
            return;
        }
        let _ = done.await;
    }

    /// Flush everything enqueued before this call and stop the worker.
    ///
    /// Idempotent.
    pub async fn stop(&self) {
        let Some(worker) = self.worker.lock().await.take() else {
            return;
        };

        if self.sender.send(Command::Stop).await.is_err() {
            warn!(run_id = self.run_id, "Status pipeline worker already gone");
        }
        if let Err(e) = worker.await {
            error!(run_id = self.run_id, error = %e, "Status pipeline worker panicked");
        }

        debug!(run_id = self.run_id, "Status pipeline stopped");
    }
}

impl StatusObserver for StatusPipeline {
    fn on_status_change(&self, sub_unit_id: &str, status: &str) {
        self.publish(ProgressEvent {
            sub_unit_id: sub_unit_id.to_string(),
            status: status.to_string(),
            observed_at: Utc::now(),
        });
    }
}

async fn run_worker(
    persistence: Arc<dyn Persistence>,
    run_id: i64,
    flush_interval: Duration,
    mut receiver: mpsc::Receiver<Command>,
) {
    let mut latest: HashMap<String, SubUnitStatus> = HashMap::new();
    // Set while the current window holds events
    let mut deadline: Option<Instant> = None;

    loop {
        let command = match deadline {
            Some(at) => {
                tokio::select! {
                    command = receiver.recv() => command,
                    _ = tokio::time::sleep_until(at) => {
                        flush(persistence.as_ref(), run_id, &mut latest).await;
                        deadline = (!latest.is_empty()).then(|| Instant::now() + flush_interval);
                        continue;
                    }
                }
            }
            None => receiver.recv().await,
        };

        match command {
            Some(Command::Event(event)) => {
                latest.insert(
                    event.sub_unit_id.clone(),
                    SubUnitStatus {
                        sub_unit_id: event.sub_unit_id,
                        status: event.status,
                        updated_at: event.observed_at,
                    },
                );
                if deadline.is_none() {
                    deadline = Some(Instant::now() + flush_interval);
                }
            }
            Some(Command::Flush(ack)) => {
                flush(persistence.as_ref(), run_id, &mut latest).await;
                deadline = (!latest.is_empty()).then(|| Instant::now() + flush_interval);
                let _ = ack.send(());
            }
            Some(Command::Stop) | None => {
                if !flush(persistence.as_ref(), run_id, &mut latest).await {
                    error!(
                        run_id = run_id,
                        count = latest.len(),
                        "Final status flush failed, statuses lost"
                    );
                }
                break;
            }
        }
    }

    info!(run_id = run_id, "Status pipeline worker exited");
}

/// Write the buffered statuses. Returns false if the write failed, in which
/// case the buffer is kept for the next window.
async fn flush(
    persistence: &dyn Persistence,
    run_id: i64,
    latest: &mut HashMap<String, SubUnitStatus>,
) -> bool {
    if latest.is_empty() {
        return true;
    }

    let mut batch: Vec<SubUnitStatus> = latest.values().cloned().collect();
    batch.sort_by(|a, b| a.sub_unit_id.cmp(&b.sub_unit_id));

    match persistence.upsert_sub_unit_statuses(run_id, &batch).await {
        Ok(()) => {
            debug!(run_id = run_id, count = batch.len(), "Flushed sub-unit statuses");
            latest.clear();
            true
        }
        Err(e) => {
            error!(
                run_id = run_id,
                count = batch.len(),
                error = %e,
                "Failed to flush sub-unit statuses, retrying next window"
            );
            false
        }
    }
}
