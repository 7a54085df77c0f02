// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for trellis-orchestrator integration tests.
//!
//! Provides a scripted engine and loader, flavor fixtures, and helpers for
//! waiting on asynchronous state changes.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use trellis_orchestrator::config::{Flavor, FlavorCatalog, ResourceQuantities};
use trellis_orchestrator::engine::{
    CancelToken, EngineError, LoadedStudy, StatusObserver, StudyEngine, StudyLoader,
};
use trellis_orchestrator::persistence::Persistence;
use trellis_orchestrator::supervisor::{ExecutionRun, RunStatus};

/// How a [`FakeEngine`] run ends.
#[derive(Debug, Clone)]
pub enum Outcome {
    /// Return success immediately after emitting the script.
    Succeed,
    /// Return a run error.
    Fail(String),
    /// Spin until the cancel token is set, then report cancellation.
    WaitForCancel,
    /// Ignore the cancel token, succeed after the delay.
    SucceedAfter(Duration),
}

/// Scripted engine: emits a fixed sequence of status changes, then ends as told.
pub struct FakeEngine {
    sub_units: Vec<String>,
    script: Vec<(String, String)>,
    outcome: Outcome,
    observers: Mutex<HashMap<String, Arc<dyn StatusObserver>>>,
    pub started: AtomicBool,
    pub released: AtomicBool,
    pub artifacts_persisted: AtomicBool,
}

impl FakeEngine {
    pub fn new(sub_units: &[&str], script: &[(&str, &str)], outcome: Outcome) -> Self {
        Self {
            sub_units: sub_units.iter().map(|s| s.to_string()).collect(),
            script: script
                .iter()
                .map(|(id, status)| (id.to_string(), status.to_string()))
                .collect(),
            outcome,
            observers: Mutex::new(HashMap::new()),
            started: AtomicBool::new(false),
            released: AtomicBool::new(false),
            artifacts_persisted: AtomicBool::new(false),
        }
    }

    /// Engine with two sub-units that each go through three statuses.
    pub fn standard(outcome: Outcome) -> Self {
        Self::new(
            &["node-a", "node-b"],
            &[
                ("node-a", "queued"),
                ("node-b", "queued"),
                ("node-a", "running"),
                ("node-a", "done"),
                ("node-b", "running"),
                ("node-b", "done"),
            ],
            outcome,
        )
    }

    pub fn observer_count(&self) -> usize {
        self.observers.lock().unwrap().len()
    }
}

impl StudyEngine for FakeEngine {
    fn run(&self, cancel: &CancelToken) -> Result<(), EngineError> {
        self.started.store(true, Ordering::SeqCst);

        for (sub_unit, status) in &self.script {
            let observer = self.observers.lock().unwrap().get(sub_unit).cloned();
            if let Some(observer) = observer {
                observer.on_status_change(sub_unit, status);
            }
        }

        match &self.outcome {
            Outcome::Succeed => Ok(()),
            Outcome::Fail(message) => Err(EngineError::Run(message.clone())),
            Outcome::WaitForCancel => {
                while !cancel.load(Ordering::SeqCst) {
                    std::thread::sleep(Duration::from_millis(5));
                }
                Err(EngineError::Cancelled)
            }
            Outcome::SucceedAfter(delay) => {
                std::thread::sleep(*delay);
                Ok(())
            }
        }
    }

    fn sub_units(&self) -> Vec<String> {
        self.sub_units.clone()
    }

    fn attach_observer(&self, sub_unit_id: &str, observer: Arc<dyn StatusObserver>) {
        self.observers
            .lock()
            .unwrap()
            .insert(sub_unit_id.to_string(), observer);
    }

    fn detach_observer(&self, sub_unit_id: &str) {
        self.observers.lock().unwrap().remove(sub_unit_id);
    }

    fn persist_artifacts(&self) -> Result<(), EngineError> {
        self.artifacts_persisted.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

/// Loader producing a fresh [`FakeEngine`] per load.
pub struct FakeLoader {
    outcome: Outcome,
    delay: Duration,
    failing: Mutex<HashSet<i64>>,
    read_only: Mutex<HashSet<i64>>,
    loaded: Mutex<Vec<(i64, Arc<FakeEngine>)>>,
    pub loads: AtomicU32,
    in_flight: AtomicU32,
    pub max_in_flight: AtomicU32,
}

impl FakeLoader {
    pub fn new(outcome: Outcome) -> Self {
        Self::with_delay(outcome, Duration::ZERO)
    }

    pub fn with_delay(outcome: Outcome, delay: Duration) -> Self {
        Self {
            outcome,
            delay,
            failing: Mutex::new(HashSet::new()),
            read_only: Mutex::new(HashSet::new()),
            loaded: Mutex::new(Vec::new()),
            loads: AtomicU32::new(0),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        }
    }

    pub fn set_failing(&self, study_id: i64, failing: bool) {
        let mut set = self.failing.lock().unwrap();
        if failing {
            set.insert(study_id);
        } else {
            set.remove(&study_id);
        }
    }

    pub fn set_read_only(&self, study_id: i64) {
        self.read_only.lock().unwrap().insert(study_id);
    }

    pub fn loads(&self) -> u32 {
        self.loads.load(Ordering::SeqCst)
    }

    /// Engines created so far for a study, oldest first.
    pub fn engines(&self, study_id: i64) -> Vec<Arc<FakeEngine>> {
        self.loaded
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| *id == study_id)
            .map(|(_, engine)| engine.clone())
            .collect()
    }
}

impl StudyLoader for FakeLoader {
    fn load(&self, study_id: i64) -> Result<LoadedStudy, EngineError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().unwrap().contains(&study_id) {
            return Err(EngineError::Load(format!("study {study_id} is corrupt")));
        }

        let engine = Arc::new(FakeEngine::standard(self.outcome.clone()));
        self.loaded.lock().unwrap().push((study_id, engine.clone()));
        Ok(LoadedStudy {
            engine,
            read_only: self.read_only.lock().unwrap().contains(&study_id),
        })
    }
}

pub fn flavor(name: &str, memory: &str, cpu: &str) -> Flavor {
    let quantities = ResourceQuantities {
        memory: memory.to_string(),
        cpu: cpu.to_string(),
    };
    Flavor {
        name: name.to_string(),
        requests: quantities.clone(),
        limits: quantities,
    }
}

pub fn catalog() -> FlavorCatalog {
    FlavorCatalog {
        session: vec![flavor("small", "1Gi", "500m"), flavor("large", "8Gi", "2")],
        batch: vec![flavor("medium", "4Gi", "1"), flavor("xlarge", "32Gi", "8")],
    }
}

/// Poll a run until it reaches a terminal status.
pub async fn wait_for_terminal_run(persistence: &dyn Persistence, run_id: i64) -> ExecutionRun {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = persistence
            .get_run(run_id)
            .await
            .expect("Failed to get run")
            .expect("Run not found");
        if run.status.is_terminal() {
            return run;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} stuck in {:?}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll a run until it reaches `status`.
pub async fn wait_for_run_status(persistence: &dyn Persistence, run_id: i64, status: RunStatus) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let run = persistence
            .get_run(run_id)
            .await
            .expect("Failed to get run")
            .expect("Run not found");
        if run.status == status {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "run {run_id} never reached {status:?}, stuck in {:?}",
            run.status
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
