// src/core/launcher/isolation.rs

//! The isolation manager: a keyed singleton registry layered over the
//! process manager. Each isolation level maps a launch request onto a
//! deterministic process id; at most one live process exists per key.

use crate::core::errors::CitrineError;
use crate::core::launcher::manifest::ManifestSet;
use crate::core::process::state::{ProcessConfig, ProcessState, ProcessUpdate};
use crate::core::process::ProcessManager;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};

/// How widely a pattern process is shared.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum IsolationLevel {
    /// A single shared process per pattern; the isolation key is constant.
    None,
    /// One process per `(pattern, namespace)`.
    Namespace,
    /// One process per `(pattern, namespace, session)`.
    Session,
}

/// Derives the deterministic process id for an isolation key. Stable across
/// restarts: the same inputs always produce the same id.
pub fn derive_process_id(
    pattern: &str,
    level: IsolationLevel,
    namespace: &str,
    session_id: &str,
) -> Result<String, CitrineError> {
    match level {
        IsolationLevel::None => Ok(format!("{pattern}-shared")),
        IsolationLevel::Namespace => {
            if namespace.is_empty() {
                return Err(CitrineError::InvalidArgument(
                    "namespace is required for namespace isolation".to_string(),
                ));
            }
            Ok(format!("{pattern}-ns-{namespace}"))
        }
        IsolationLevel::Session => {
            if namespace.is_empty() {
                return Err(CitrineError::InvalidArgument(
                    "namespace is required for session isolation".to_string(),
                ));
            }
            if session_id.is_empty() {
                return Err(CitrineError::InvalidArgument(
                    "session id is required for session isolation".to_string(),
                ));
            }
            Ok(format!("{pattern}-ns-{namespace}-sess-{session_id}"))
        }
    }
}

/// A request to route work onto a pattern process.
#[derive(Debug, Clone, Default)]
pub struct LaunchRequest {
    pub pattern: String,
    pub namespace: String,
    pub session_id: String,
    /// Pass-through configuration injected into the process environment.
    pub config: BTreeMap<String, String>,
}

/// The result of a `get_or_create_process` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchOutcome {
    pub process_id: String,
    /// False when an already-live process was reused.
    pub created: bool,
}

/// Routes launch requests to one process per isolation key.
pub struct IsolationManager {
    manager: ProcessManager,
    manifests: Arc<ManifestSet>,
    /// Per-key serialization: concurrent get_or_create on the same key must
    /// resolve to the same process.
    locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl IsolationManager {
    pub fn new(manager: ProcessManager, manifests: Arc<ManifestSet>) -> Self {
        Self {
            manager,
            manifests,
            locks: DashMap::new(),
        }
    }

    pub fn manager(&self) -> &ProcessManager {
        &self.manager
    }

    /// Returns the live process for the request's isolation key, creating it
    /// if absent. A finished entry is removed and recreated; a terminating
    /// one is refused until it completes.
    pub async fn get_or_create_process(
        &self,
        req: &LaunchRequest,
    ) -> Result<LaunchOutcome, CitrineError> {
        let manifest = self.manifests.get(&req.pattern).ok_or_else(|| {
            CitrineError::InvalidArgument(format!("unknown pattern '{}'", req.pattern))
        })?;
        let level = manifest.isolation_level;
        let process_id = derive_process_id(&req.pattern, level, &req.namespace, &req.session_id)?;

        let key_lock = self
            .locks
            .entry(process_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = key_lock.lock().await;

        match self.manager.state_of(&process_id) {
            Some(state) if state <= ProcessState::Syncing => {
                debug!("Reusing live process '{}' ({})", process_id, state);
                return Ok(LaunchOutcome {
                    process_id,
                    created: false,
                });
            }
            Some(ProcessState::Finished) => {
                // The explicit delete half of delete-and-recreate.
                self.manager.remove_finished(&process_id);
            }
            Some(state) => {
                return Err(CitrineError::CircuitOpen(format!(
                    "{process_id} (state {state})"
                )));
            }
            None => {}
        }

        // Env-visible isolation fields are empty outside their level.
        let namespace = match level {
            IsolationLevel::None => String::new(),
            _ => req.namespace.clone(),
        };
        let session_id = match level {
            IsolationLevel::Session => req.session_id.clone(),
            _ => String::new(),
        };

        let mut environment = manifest.environment.clone();
        environment.extend(req.config.clone());

        let config = ProcessConfig {
            process_id: process_id.clone(),
            pattern: req.pattern.clone(),
            namespace,
            session_id,
            executable: manifest.resolved_executable(),
            health_path: manifest.healthcheck.path.clone(),
            environment,
        };

        info!(
            "Creating process '{}' for pattern '{}' (isolation {})",
            process_id, req.pattern, level
        );
        self.manager
            .update_process(&process_id, ProcessUpdate::create(config))?;
        Ok(LaunchOutcome {
            process_id,
            created: true,
        })
    }

    /// Requests a graceful stop of the process behind an isolation key.
    pub async fn terminate_process(
        &self,
        pattern: &str,
        namespace: &str,
        session_id: &str,
        grace_period: Option<std::time::Duration>,
    ) -> Result<String, CitrineError> {
        let manifest = self.manifests.get(pattern).ok_or_else(|| {
            CitrineError::InvalidArgument(format!("unknown pattern '{pattern}'"))
        })?;
        let process_id =
            derive_process_id(pattern, manifest.isolation_level, namespace, session_id)?;

        let key_lock = self
            .locks
            .entry(process_id.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        let _guard = key_lock.lock().await;

        let current = self
            .manager
            .state_of(&process_id)
            .ok_or_else(|| CitrineError::InvalidArgument(format!(
                "process '{process_id}' is not managed"
            )))?;
        let config = ProcessConfig {
            process_id: process_id.clone(),
            pattern: pattern.to_string(),
            namespace: namespace.to_string(),
            session_id: session_id.to_string(),
            executable: manifest.resolved_executable(),
            health_path: manifest.healthcheck.path.clone(),
            environment: manifest.environment.clone(),
        };
        debug!("Terminating process '{}' (state {})", process_id, current);
        self.manager
            .update_process(&process_id, ProcessUpdate::terminate(config, grace_period))?;
        Ok(process_id)
    }
}
