// src/core/admin/state.rs

//! The replicated admin state: cluster membership maps and the root state
//! object owned by the FSM.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::{SystemTime, UNIX_EPOCH};

/// The current schema tag of `AdminState`. Snapshots are not cross-version;
/// bumping this requires a coordinated rollout.
pub const ADMIN_STATE_VERSION: u32 = 1;

/// Helper to get the current system time in whole seconds since the UNIX epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Health of a registered proxy or launcher as last reported.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

/// Lifecycle status of a pattern assignment.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    bincode::Encode,
    bincode::Decode,
    strum_macros::Display,
    strum_macros::EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum PatternStatus {
    Running,
    Stopped,
    Error,
}

/// A data-plane proxy registered with the control plane. Never deleted by the
/// core; health transitions come from status updates and heartbeats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ProxyInfo {
    pub proxy_id: String,
    pub address: String,
    pub region: String,
    pub version: String,
    pub capabilities: BTreeSet<String>,
    pub status: HealthStatus,
    pub last_seen: u64,
    pub registered_at: u64,
    /// Opaque resource report, passed through untouched.
    pub resources: BTreeMap<String, String>,
}

/// A worker host running the launcher agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LauncherInfo {
    pub launcher_id: String,
    pub address: String,
    pub region: String,
    pub version: String,
    pub process_types: BTreeSet<String>,
    pub status: HealthStatus,
    pub last_seen: u64,
    pub registered_at: u64,
    pub max_processes: i32,
    pub available_slots: i32,
    pub resources: BTreeMap<String, String>,
}

/// A namespace with its partition placement. The partition id and assigned
/// proxy are derived from the proxy set at creation time but persisted; they
/// do not follow later proxy set changes unless explicitly rewritten.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct NamespaceInfo {
    pub name: String,
    pub partition_id: i32,
    pub assigned_proxy: String,
    pub config: BTreeMap<String, String>,
    pub created_by: String,
    pub created_at: u64,
    pub updated_at: u64,
}

/// A pattern-to-launcher placement decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct PatternAssignment {
    pub pattern_id: String,
    pub pattern_type: String,
    pub launcher_id: String,
    pub namespace: String,
    pub config: BTreeMap<String, String>,
    pub status: PatternStatus,
    pub assigned_at: u64,
    pub updated_at: u64,
}

/// The root replicated state, owned exclusively by the admin FSM.
///
/// All maps are keyed by the entity's own primary identifier. `BTreeMap`
/// keeps iteration order stable, which the partition range math relies on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AdminState {
    pub version: u32,
    pub proxies: BTreeMap<String, ProxyInfo>,
    pub launchers: BTreeMap<String, LauncherInfo>,
    pub namespaces: BTreeMap<String, NamespaceInfo>,
    pub patterns: BTreeMap<String, PatternAssignment>,
    pub last_applied_index: u64,
    pub last_applied_term: u64,
    pub state_updated_at: u64,
}

impl Default for AdminState {
    fn default() -> Self {
        Self {
            version: ADMIN_STATE_VERSION,
            proxies: BTreeMap::new(),
            launchers: BTreeMap::new(),
            namespaces: BTreeMap::new(),
            patterns: BTreeMap::new(),
            last_applied_index: 0,
            last_applied_term: 0,
            state_updated_at: 0,
        }
    }
}

/// A point-in-time snapshot of the admin state, serialized to the Raft
/// snapshot sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AdminSnapshot {
    pub last_applied_index: u64,
    pub last_applied_term: u64,
    pub snapshot_time: u64,
    pub state: AdminState,
}
