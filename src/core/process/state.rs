// src/core/process/state.rs

//! The per-process lifecycle state machine and the update records fed to it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// The strictly monotonic process lifecycle. Reverse transitions are
/// forbidden; the `Ord` derive encodes the progression.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[strum(serialize_all = "lowercase")]
pub enum ProcessState {
    Starting,
    Syncing,
    Terminating,
    Terminated,
    Finished,
}

/// What a process update asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Create,
    Update,
    Terminate,
}

/// Everything the syncer needs to launch and probe one pattern process.
/// Built by the isolation manager from the manifest and the launch request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessConfig {
    pub process_id: String,
    pub pattern: String,
    pub namespace: String,
    pub session_id: String,
    /// Absolute path of the pattern executable.
    pub executable: PathBuf,
    /// HTTP path the pattern serves its readiness probe on.
    pub health_path: String,
    /// Merged environment: manifest `environment` plus request config.
    pub environment: BTreeMap<String, String>,
}

/// One queued intent for a process. The pending slot collapses bursts into
/// "most recent wins".
#[derive(Debug, Clone)]
pub struct ProcessUpdate {
    pub kind: UpdateKind,
    pub config: ProcessConfig,
    /// Terminate only; `None` means the default grace period.
    pub grace_period: Option<Duration>,
}

impl ProcessUpdate {
    pub fn create(config: ProcessConfig) -> Self {
        Self {
            kind: UpdateKind::Create,
            config,
            grace_period: None,
        }
    }

    pub fn update(config: ProcessConfig) -> Self {
        Self {
            kind: UpdateKind::Update,
            config,
            grace_period: None,
        }
    }

    pub fn terminate(config: ProcessConfig, grace_period: Option<Duration>) -> Self {
        Self {
            kind: UpdateKind::Terminate,
            config,
            grace_period,
        }
    }
}

/// A read-only snapshot of one managed process, for heartbeats and the
/// monitoring passes.
#[derive(Debug, Clone)]
pub struct ProcessView {
    pub process_id: String,
    pub state: ProcessState,
    pub working: bool,
    pub consecutive_fails: u32,
}
