// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for trellis-orchestrator.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::allocation::{AllocationConfig, AllocationKind};
use crate::cache::CacheConfig;

/// Where a workload is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStrategy {
    /// Run inside this process on a blocking worker thread.
    Thread,
    /// Spawn an OS process.
    Subprocess,
    /// Create a pod through the container orchestrator.
    Orchestrator,
}

impl ExecutionStrategy {
    /// Get the strategy string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStrategy::Thread => "thread",
            ExecutionStrategy::Subprocess => "subprocess",
            ExecutionStrategy::Orchestrator => "orchestrator",
        }
    }
}

impl fmt::Display for ExecutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExecutionStrategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "thread" => Ok(ExecutionStrategy::Thread),
            "subprocess" | "process" => Ok(ExecutionStrategy::Subprocess),
            "orchestrator" | "kubernetes" | "k8s" => Ok(ExecutionStrategy::Orchestrator),
            other => Err(ConfigError::UnknownStrategy(other.to_string())),
        }
    }
}

/// CPU and memory quantities in orchestrator notation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceQuantities {
    /// Memory quantity (e.g. `2Gi`).
    pub memory: String,
    /// CPU quantity (e.g. `500m`).
    pub cpu: String,
}

/// A named resource size class.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Flavor {
    /// Flavor name (e.g. `small`).
    pub name: String,
    /// Guaranteed resources.
    pub requests: ResourceQuantities,
    /// Hard ceilings.
    pub limits: ResourceQuantities,
}

/// Flavors for interactive sessions and for batch workloads.
///
/// Order is significant: the first flavor of a family is the fallback for
/// unknown names.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlavorCatalog {
    /// Flavors for study sessions.
    #[serde(default)]
    pub session: Vec<Flavor>,
    /// Flavors for executions and reference generation.
    #[serde(default)]
    pub batch: Vec<Flavor>,
}

impl FlavorCatalog {
    /// Parse and validate a catalog from JSON.
    ///
    /// Every flavor must carry `requests` and `limits`, each with `memory` and `cpu`.
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let root: Value = serde_json::from_str(json)
            .map_err(|e| ConfigError::InvalidFlavorCatalog(e.to_string()))?;
        let Some(families) = root.as_object() else {
            return Err(ConfigError::InvalidFlavorCatalog(
                "catalog must be a JSON object".to_string(),
            ));
        };

        let mut catalog = FlavorCatalog::default();
        for (family, flavors) in families {
            let target = match family.as_str() {
                "session" => &mut catalog.session,
                "batch" => &mut catalog.batch,
                other => {
                    return Err(ConfigError::InvalidFlavorCatalog(format!(
                        "unknown flavor family `{other}`"
                    )));
                }
            };
            let Some(entries) = flavors.as_array() else {
                return Err(ConfigError::InvalidFlavorCatalog(format!(
                    "`{family}` must be an array of flavors"
                )));
            };
            for entry in entries {
                target.push(validate_flavor(family, entry)?);
            }
        }

        if catalog.session.is_empty() && catalog.batch.is_empty() {
            return Err(ConfigError::InvalidFlavorCatalog(
                "catalog defines no flavors".to_string(),
            ));
        }

        Ok(catalog)
    }

    /// Flavors configured for a workload kind.
    pub fn flavors_for(&self, kind: AllocationKind) -> &[Flavor] {
        if kind.is_session() {
            &self.session
        } else {
            &self.batch
        }
    }

    /// Look up a flavor, falling back to the first flavor of the family.
    ///
    /// Returns the flavor and whether the fallback was used.
    pub fn select(&self, kind: AllocationKind, name: &str) -> Option<(&Flavor, bool)> {
        let flavors = self.flavors_for(kind);
        match flavors.iter().find(|f| f.name == name) {
            Some(flavor) => Some((flavor, false)),
            None => flavors.first().map(|f| (f, true)),
        }
    }
}

fn validate_flavor(family: &str, entry: &Value) -> Result<Flavor, ConfigError> {
    let name = entry
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ConfigError::InvalidFlavor {
            flavor: format!("{family}[?]"),
            reason: "missing `name`".to_string(),
        })?;

    for section in ["requests", "limits"] {
        let Some(quantities) = entry.get(section).and_then(Value::as_object) else {
            return Err(ConfigError::InvalidFlavor {
                flavor: name.to_string(),
                reason: format!("missing `{section}`"),
            });
        };
        for key in ["memory", "cpu"] {
            if !quantities.get(key).is_some_and(Value::is_string) {
                return Err(ConfigError::InvalidFlavor {
                    flavor: name.to_string(),
                    reason: format!("`{section}` is missing `{key}`"),
                });
            }
        }
    }

    serde_json::from_value(entry.clone()).map_err(|e| ConfigError::InvalidFlavor {
        flavor: name.to_string(),
        reason: e.to_string(),
    })
}

/// Orchestrator configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL URL (required by the standalone binary only)
    pub database_url: Option<String>,
    /// Strategy for interactive study sessions
    pub session_strategy: ExecutionStrategy,
    /// Strategy for executions and reference generation
    pub batch_strategy: ExecutionStrategy,
    /// Resource flavors
    pub flavors: FlavorCatalog,
    /// Orchestrator namespace for created resources
    pub namespace: String,
    /// Container image for worker pods
    pub worker_image: String,
    /// Program and arguments for the subprocess strategy
    pub subprocess_command: Vec<String>,
    /// Minimum interval between two last-activity writes for one study
    pub activity_flush_interval: Duration,
    /// How long `allocate` waits for a pod to report a phase
    pub phase_wait_timeout: Duration,
    /// Interval of the reconcile loop
    pub reconcile_interval: Duration,
    /// Age after which completed batch allocations are garbage collected
    pub allocation_retention: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: None,
            session_strategy: ExecutionStrategy::Thread,
            batch_strategy: ExecutionStrategy::Thread,
            flavors: FlavorCatalog::default(),
            namespace: "default".to_string(),
            worker_image: "trellis-worker:latest".to_string(),
            subprocess_command: vec!["trellis-worker".to_string()],
            activity_flush_interval: Duration::from_secs(5),
            phase_wait_timeout: Duration::from_secs(600),
            reconcile_interval: Duration::from_secs(10),
            allocation_retention: Duration::from_secs(24 * 3600),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let session_strategy = match lookup("TRELLIS_SESSION_STRATEGY") {
            Some(v) => v.parse()?,
            None => defaults.session_strategy,
        };
        let batch_strategy = match lookup("TRELLIS_BATCH_STRATEGY") {
            Some(v) => v.parse()?,
            None => defaults.batch_strategy,
        };

        let catalog_json = match (
            lookup("TRELLIS_FLAVOR_CATALOG"),
            lookup("TRELLIS_FLAVOR_CATALOG_PATH"),
        ) {
            (Some(inline), _) => Some(inline),
            (None, Some(path)) => {
                let path = PathBuf::from(path);
                Some(std::fs::read_to_string(&path).map_err(|e| {
                    ConfigError::InvalidFlavorCatalog(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    ))
                })?)
            }
            (None, None) => None,
        };

        let flavors = match catalog_json {
            Some(json) => FlavorCatalog::from_json(&json)?,
            None => FlavorCatalog::default(),
        };

        let uses_orchestrator = session_strategy == ExecutionStrategy::Orchestrator
            || batch_strategy == ExecutionStrategy::Orchestrator;
        if uses_orchestrator {
            if session_strategy == ExecutionStrategy::Orchestrator && flavors.session.is_empty() {
                return Err(ConfigError::MissingFlavors("session"));
            }
            if batch_strategy == ExecutionStrategy::Orchestrator && flavors.batch.is_empty() {
                return Err(ConfigError::MissingFlavors("batch"));
            }
        }

        let subprocess_command = match lookup("TRELLIS_SUBPROCESS_COMMAND") {
            Some(cmd) => {
                let parts: Vec<String> = cmd.split_whitespace().map(str::to_string).collect();
                if parts.is_empty() {
                    return Err(ConfigError::InvalidValue("TRELLIS_SUBPROCESS_COMMAND"));
                }
                parts
            }
            None => defaults.subprocess_command,
        };

        Ok(Self {
            database_url: lookup("TRELLIS_DATABASE_URL"),
            session_strategy,
            batch_strategy,
            flavors,
            namespace: lookup("TRELLIS_NAMESPACE").unwrap_or(defaults.namespace),
            worker_image: lookup("TRELLIS_WORKER_IMAGE").unwrap_or(defaults.worker_image),
            subprocess_command,
            activity_flush_interval: secs(
                &lookup,
                "TRELLIS_ACTIVITY_FLUSH_INTERVAL_SECS",
                defaults.activity_flush_interval,
            )?,
            phase_wait_timeout: secs(
                &lookup,
                "TRELLIS_PHASE_WAIT_TIMEOUT_SECS",
                defaults.phase_wait_timeout,
            )?,
            reconcile_interval: secs(
                &lookup,
                "TRELLIS_RECONCILE_INTERVAL_SECS",
                defaults.reconcile_interval,
            )?,
            allocation_retention: match lookup("TRELLIS_ALLOCATION_RETENTION_HOURS") {
                Some(v) => {
                    let hours: u64 = v
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue("TRELLIS_ALLOCATION_RETENTION_HOURS"))?;
                    Duration::from_secs(hours * 3600)
                }
                None => defaults.allocation_retention,
            },
        })
    }

    /// Allocation manager settings derived from this configuration.
    pub fn allocation_config(&self) -> AllocationConfig {
        AllocationConfig {
            session_strategy: self.session_strategy,
            batch_strategy: self.batch_strategy,
            flavors: self.flavors.clone(),
            namespace: self.namespace.clone(),
            worker_image: self.worker_image.clone(),
            subprocess_command: self.subprocess_command.clone(),
            phase_wait_timeout: self.phase_wait_timeout,
            ..AllocationConfig::default()
        }
    }

    /// Cache settings derived from this configuration.
    pub fn cache_config(&self) -> CacheConfig {
        CacheConfig {
            activity_flush_interval: self.activity_flush_interval,
        }
    }
}

fn secs<F>(lookup: &F, name: &'static str, default: Duration) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(v) => v
            .parse::<u64>()
            .map(Duration::from_secs)
            .map_err(|_| ConfigError::InvalidValue(name)),
        None => Ok(default),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// An environment variable has an unparsable value.
    #[error("Invalid value for {0}")]
    InvalidValue(&'static str),
    /// The execution strategy is not one of thread, subprocess, orchestrator.
    #[error("Unknown execution strategy: {0}")]
    UnknownStrategy(String),
    /// The flavor catalog could not be read or parsed.
    #[error("Invalid flavor catalog: {0}")]
    InvalidFlavorCatalog(String),
    /// A flavor entry is incomplete.
    #[error("Invalid flavor `{flavor}`: {reason}")]
    InvalidFlavor {
        /// Flavor name.
        flavor: String,
        /// What is wrong with it.
        reason: String,
    },
    /// The orchestrator strategy is selected but no flavors are configured.
    #[error("Orchestrator strategy selected but no {0} flavors are configured")]
    MissingFlavors(&'static str),
    /// The orchestrator strategy is selected but no orchestrator client was provided.
    #[error("Orchestrator strategy selected but no orchestrator client is configured")]
    MissingOrchestrator,
}
