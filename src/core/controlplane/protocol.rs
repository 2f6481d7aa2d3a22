// src/core/controlplane/protocol.rs

//! The control-plane RPC surface: typed request/response messages carried as
//! length-delimited bincode frames over TCP.

use crate::core::admin::partition::PartitionRange;
use crate::core::admin::state::{
    HealthStatus, LauncherInfo, NamespaceInfo, PatternAssignment, ProxyInfo,
};
use crate::core::commands::{
    AssignPatternCmd, CreateNamespaceCmd, RegisterLauncherCmd, RegisterProxyCmd,
};
use crate::core::errors::CitrineError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A proxy's periodic liveness report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ProxyHeartbeat {
    pub proxy_id: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub resources: Option<BTreeMap<String, String>>,
}

/// A launcher's periodic liveness and capacity report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LauncherHeartbeatRequest {
    pub launcher_id: String,
    pub status: HealthStatus,
    #[serde(default)]
    pub available_slots: Option<i32>,
    #[serde(default)]
    pub resources: Option<BTreeMap<String, String>>,
}

/// Pins a namespace to an explicit proxy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct AssignNamespaceRequest {
    pub name: String,
    pub proxy_id: String,
    #[serde(default)]
    pub config: BTreeMap<String, String>,
    pub issued_by: String,
}

/// A lifecycle observation reported by a launcher agent, best-effort.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LifecycleEventReport {
    pub launcher_id: String,
    pub process_id: String,
    pub pattern: String,
    pub event: String,
    pub message: String,
    pub timestamp: u64,
}

/// Every operation the control plane serves.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum RpcRequest {
    RegisterProxy(RegisterProxyCmd),
    RegisterLauncher(RegisterLauncherCmd),
    CreateNamespace(CreateNamespaceCmd),
    AssignNamespace(AssignNamespaceRequest),
    AssignPattern(AssignPatternCmd),
    RevokeNamespace { name: String },
    RevokeProcess { pattern_id: String },
    Heartbeat(ProxyHeartbeat),
    LauncherHeartbeat(LauncherHeartbeatRequest),
    GetNamespace { name: String },
    ListNamespaces,
    GetProxy { proxy_id: String },
    ListProxies,
    ListLaunchers,
    ListPatterns,
    ReportLifecycleEvent(LifecycleEventReport),
    ClusterStatus,
}

impl RpcRequest {
    /// Metrics label for the operation.
    pub fn op_name(&self) -> &'static str {
        match self {
            RpcRequest::RegisterProxy(_) => "register_proxy",
            RpcRequest::RegisterLauncher(_) => "register_launcher",
            RpcRequest::CreateNamespace(_) => "create_namespace",
            RpcRequest::AssignNamespace(_) => "assign_namespace",
            RpcRequest::AssignPattern(_) => "assign_pattern",
            RpcRequest::RevokeNamespace { .. } => "revoke_namespace",
            RpcRequest::RevokeProcess { .. } => "revoke_process",
            RpcRequest::Heartbeat(_) => "heartbeat",
            RpcRequest::LauncherHeartbeat(_) => "launcher_heartbeat",
            RpcRequest::GetNamespace { .. } => "get_namespace",
            RpcRequest::ListNamespaces => "list_namespaces",
            RpcRequest::GetProxy { .. } => "get_proxy",
            RpcRequest::ListProxies => "list_proxies",
            RpcRequest::ListLaunchers => "list_launchers",
            RpcRequest::ListPatterns => "list_patterns",
            RpcRequest::ReportLifecycleEvent(_) => "report_lifecycle_event",
            RpcRequest::ClusterStatus => "cluster_status",
        }
    }

    /// Whether the operation mutates replicated state (and therefore needs
    /// the leader).
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            RpcRequest::RegisterProxy(_)
                | RpcRequest::RegisterLauncher(_)
                | RpcRequest::CreateNamespace(_)
                | RpcRequest::AssignNamespace(_)
                | RpcRequest::AssignPattern(_)
                | RpcRequest::RevokeNamespace { .. }
                | RpcRequest::RevokeProcess { .. }
                | RpcRequest::Heartbeat(_)
                | RpcRequest::LauncherHeartbeat(_)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ProxyRegistrationAck {
    pub success: bool,
    pub message: String,
    /// Namespaces whose partition falls inside the proxy's computed range,
    /// read under stale consistency.
    pub initial_namespaces: Vec<NamespaceInfo>,
    pub partition_ranges: Vec<PartitionRange>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct LauncherRegistrationAck {
    pub success: bool,
    pub message: String,
    /// Pattern assignments already targeting this launcher.
    pub initial_processes: Vec<PatternAssignment>,
    pub assigned_capacity: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct CreateNamespaceAck {
    pub success: bool,
    pub message: String,
    pub assigned_partition: i32,
    pub assigned_proxy: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct HeartbeatAck {
    pub success: bool,
    pub server_timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct GenericAck {
    pub success: bool,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct ClusterStatusInfo {
    pub node_id: u64,
    pub is_leader: bool,
    pub leader_id: Option<u64>,
    pub leader_address: Option<String>,
    pub term: u64,
    pub last_applied_index: u64,
    pub members: u32,
}

/// RPC failure classes, mirroring the error taxonomy onto the wire.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub enum RpcErrorCode {
    Unavailable,
    InvalidArgument,
    NotFound,
    Unimplemented,
    DeadlineExceeded,
    Internal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub struct RpcFailure {
    pub code: RpcErrorCode,
    pub message: String,
}

impl From<&CitrineError> for RpcFailure {
    fn from(e: &CitrineError) -> Self {
        let code = match e {
            CitrineError::NotLeader(_) | CitrineError::Unavailable(_) => RpcErrorCode::Unavailable,
            CitrineError::InvalidArgument(_) => RpcErrorCode::InvalidArgument,
            CitrineError::NotRegistered(_) => RpcErrorCode::NotFound,
            CitrineError::ProposeTimeout(_) | CitrineError::Cancelled(_) => {
                RpcErrorCode::DeadlineExceeded
            }
            _ => RpcErrorCode::Internal,
        };
        RpcFailure {
            code,
            message: e.to_string(),
        }
    }
}

/// Every answer the control plane returns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum RpcResponse {
    RegisterProxy(ProxyRegistrationAck),
    RegisterLauncher(LauncherRegistrationAck),
    CreateNamespace(CreateNamespaceAck),
    Heartbeat(HeartbeatAck),
    Ack(GenericAck),
    Namespace(Option<NamespaceInfo>),
    Namespaces(Vec<NamespaceInfo>),
    Proxy(Option<ProxyInfo>),
    Proxies(Vec<ProxyInfo>),
    Launchers(Vec<LauncherInfo>),
    Patterns(Vec<PatternAssignment>),
    ClusterStatus(ClusterStatusInfo),
    Error(RpcFailure),
}

impl RpcResponse {
    pub fn error(e: &CitrineError) -> Self {
        RpcResponse::Error(RpcFailure::from(e))
    }

    pub fn unavailable(message: impl Into<String>) -> Self {
        RpcResponse::Error(RpcFailure {
            code: RpcErrorCode::Unavailable,
            message: message.into(),
        })
    }
}

// --- Frame codec helpers ---

pub fn encode_request(req: &RpcRequest) -> Result<Vec<u8>, CitrineError> {
    Ok(bincode::encode_to_vec(req, bincode::config::standard())?)
}

pub fn decode_request(bytes: &[u8]) -> Result<RpcRequest, CitrineError> {
    let (req, _) = bincode::decode_from_slice::<RpcRequest, _>(bytes, bincode::config::standard())?;
    Ok(req)
}

pub fn encode_response(resp: &RpcResponse) -> Result<Vec<u8>, CitrineError> {
    Ok(bincode::encode_to_vec(resp, bincode::config::standard())?)
}

pub fn decode_response(bytes: &[u8]) -> Result<RpcResponse, CitrineError> {
    let (resp, _) =
        bincode::decode_from_slice::<RpcResponse, _>(bytes, bincode::config::standard())?;
    Ok(resp)
}
