// src/core/commands.rs

//! The replicated command log entries: every mutation of the admin state is
//! one of these, ordered by the Raft log.

use crate::core::admin::state::HealthStatus;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// A single replicated mutation. The payload carries the typed command; the
/// envelope records provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct Command {
    /// Unix seconds at propose time, as stamped by the issuing node.
    pub timestamp: u64,
    /// Identity of the issuing client or node, for the audit trail.
    pub issuer: String,
    pub payload: CommandPayload,
}

/// The recognized command types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum CommandPayload {
    RegisterProxy(RegisterProxyCmd),
    RegisterLauncher(RegisterLauncherCmd),
    CreateNamespace(CreateNamespaceCmd),
    AssignPattern(AssignPatternCmd),
    UpdateProxyStatus(UpdateStatusCmd),
    UpdateLauncherStatus(UpdateStatusCmd),
}

impl Command {
    pub fn new(issuer: impl Into<String>, payload: CommandPayload) -> Self {
        Self {
            timestamp: crate::core::admin::state::now_secs(),
            issuer: issuer.into(),
            payload,
        }
    }

    /// The wire name of the command type, used for metrics labels and audit
    /// rows.
    pub fn kind(&self) -> &'static str {
        match &self.payload {
            CommandPayload::RegisterProxy(_) => "REGISTER_PROXY",
            CommandPayload::RegisterLauncher(_) => "REGISTER_LAUNCHER",
            CommandPayload::CreateNamespace(_) => "CREATE_NAMESPACE",
            CommandPayload::AssignPattern(_) => "ASSIGN_PATTERN",
            CommandPayload::UpdateProxyStatus(_) => "UPDATE_PROXY_STATUS",
            CommandPayload::UpdateLauncherStatus(_) => "UPDATE_LAUNCHER_STATUS",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RegisterProxyCmd {
    pub proxy_id: String,
    pub address: String,
    pub region: String,
    pub version: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RegisterLauncherCmd {
    pub launcher_id: String,
    pub address: String,
    pub region: String,
    pub version: String,
    #[serde(default)]
    pub process_types: BTreeSet<String>,
    pub max_processes: i32,
    #[serde(default)]
    pub resources: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct CreateNamespaceCmd {
    pub name: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub created_by: String,
    /// When set, pins the namespace to this proxy instead of the one computed
    /// from the partition ranges.
    #[serde(default)]
    pub assigned_proxy: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AssignPatternCmd {
    pub pattern_id: String,
    pub pattern_type: String,
    pub launcher_id: String,
    pub namespace: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
}

/// Status refresh for an already-registered proxy or launcher. Heartbeats
/// reduce to this command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct UpdateStatusCmd {
    pub target_id: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub resources: Option<BTreeMap<String, String>>,
    #[serde(default)]
    pub available_slots: Option<i32>,
}

/// The FSM's answer to one applied command. `ok == false` marks an apply that
/// committed but changed nothing (e.g. a status update for an unregistered
/// entity); it is surfaced in metrics, not as a Raft failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplyOutcome {
    pub ok: bool,
    pub message: String,
}

impl ApplyOutcome {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
        }
    }
}
