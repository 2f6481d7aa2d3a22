// src/core/controlplane/service.rs

//! The control-plane service: classifies each RPC as read or write, proposes
//! writes through Raft on the leader, forwards from followers, and serves
//! reads under the operation's consistency tier.

use crate::config::{ReadConsistency, ReadConsistencyConfig};
use crate::core::admin::AdminFsm;
use crate::core::admin::mirror::MirrorOp;
use crate::core::admin::partition;
use crate::core::admin::state::{AdminState, now_secs};
use crate::core::commands::{Command, CommandPayload, CreateNamespaceCmd, UpdateStatusCmd};
use crate::core::controlplane::forward::LeaderForwarder;
use crate::core::controlplane::protocol::{
    ClusterStatusInfo, CreateNamespaceAck, GenericAck, HeartbeatAck, LauncherRegistrationAck,
    ProxyRegistrationAck, RpcErrorCode, RpcFailure, RpcRequest, RpcResponse,
};
use crate::core::errors::CitrineError;
use crate::core::metrics;
use crate::core::raft::RaftNode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The RPC dispatch core, shared by every connection handler.
pub struct ControlPlaneService {
    fsm: Arc<AdminFsm>,
    raft: Arc<RaftNode>,
    forwarder: Arc<LeaderForwarder>,
    consistency: ReadConsistencyConfig,
    /// Bound on follower read lag; recorded for operators, enforced by the
    /// steady heartbeat cadence.
    #[allow(dead_code)]
    max_staleness: Duration,
}

impl ControlPlaneService {
    pub fn new(
        fsm: Arc<AdminFsm>,
        raft: Arc<RaftNode>,
        consistency: ReadConsistencyConfig,
        max_staleness: Duration,
    ) -> Self {
        Self {
            fsm,
            raft,
            forwarder: Arc::new(LeaderForwarder::new()),
            consistency,
            max_staleness,
        }
    }

    /// Serves one RPC to completion.
    pub async fn handle(self: &Arc<Self>, req: RpcRequest) -> RpcResponse {
        metrics::RPC_REQUESTS_TOTAL
            .with_label_values(&[req.op_name()])
            .inc();

        if req.is_write() && !self.raft.is_leader() {
            // Heartbeats are acknowledged immediately and forwarded in the
            // background, so proxy liveness reporting is not tied to leader
            // round-trip time.
            let is_heartbeat = matches!(
                req,
                RpcRequest::Heartbeat(_) | RpcRequest::LauncherHeartbeat(_)
            );
            return if is_heartbeat {
                self.ack_and_forward_heartbeat(req)
            } else {
                self.forward_to_leader(&req).await
            };
        }

        match req {
            RpcRequest::RegisterProxy(cmd) => self.register_proxy(cmd).await,
            RpcRequest::RegisterLauncher(cmd) => self.register_launcher(cmd).await,
            RpcRequest::CreateNamespace(cmd) => self.create_namespace(cmd).await,
            RpcRequest::AssignNamespace(req) => {
                let cmd = CreateNamespaceCmd {
                    name: req.name,
                    config: req.config,
                    created_by: req.issued_by,
                    assigned_proxy: Some(req.proxy_id),
                };
                self.create_namespace(cmd).await
            }
            RpcRequest::AssignPattern(cmd) => {
                let command = Command::new(cmd.launcher_id.clone(), CommandPayload::AssignPattern(cmd));
                match self.raft.propose(command).await {
                    Ok(outcome) => RpcResponse::Ack(GenericAck {
                        success: outcome.ok,
                        message: outcome.message,
                    }),
                    Err(e) => RpcResponse::error(&e),
                }
            }
            RpcRequest::RevokeNamespace { name } => {
                debug!("RevokeNamespace('{}') is reserved", name);
                RpcResponse::Error(RpcFailure {
                    code: RpcErrorCode::Unimplemented,
                    message: "namespace revocation is reserved".to_string(),
                })
            }
            RpcRequest::RevokeProcess { pattern_id } => {
                debug!("RevokeProcess('{}') is reserved", pattern_id);
                RpcResponse::Error(RpcFailure {
                    code: RpcErrorCode::Unimplemented,
                    message: "process revocation is reserved".to_string(),
                })
            }
            RpcRequest::Heartbeat(hb) => {
                metrics::HEARTBEATS_TOTAL.with_label_values(&["proxy"]).inc();
                let command = Command::new(
                    hb.proxy_id.clone(),
                    CommandPayload::UpdateProxyStatus(UpdateStatusCmd {
                        target_id: hb.proxy_id,
                        status: hb.status,
                        resources: hb.resources,
                        available_slots: None,
                    }),
                );
                self.propose_heartbeat(command).await
            }
            RpcRequest::LauncherHeartbeat(hb) => {
                metrics::HEARTBEATS_TOTAL
                    .with_label_values(&["launcher"])
                    .inc();
                let command = Command::new(
                    hb.launcher_id.clone(),
                    CommandPayload::UpdateLauncherStatus(UpdateStatusCmd {
                        target_id: hb.launcher_id,
                        status: hb.status,
                        resources: hb.resources,
                        available_slots: hb.available_slots,
                    }),
                );
                self.propose_heartbeat(command).await
            }
            RpcRequest::GetNamespace { name } => {
                let req = RpcRequest::GetNamespace { name: name.clone() };
                self.gated_read(&req, self.consistency.get_namespace, move |s| {
                    RpcResponse::Namespace(s.namespaces.get(&name).cloned())
                })
                .await
            }
            RpcRequest::ListNamespaces => {
                self.gated_read(&RpcRequest::ListNamespaces, self.consistency.list_namespaces, |s| {
                    RpcResponse::Namespaces(s.namespaces.values().cloned().collect())
                })
                .await
            }
            RpcRequest::GetProxy { proxy_id } => {
                let req = RpcRequest::GetProxy {
                    proxy_id: proxy_id.clone(),
                };
                self.gated_read(&req, self.consistency.get_proxy, move |s| {
                    RpcResponse::Proxy(s.proxies.get(&proxy_id).cloned())
                })
                .await
            }
            RpcRequest::ListProxies => {
                self.gated_read(&RpcRequest::ListProxies, self.consistency.list_proxies, |s| {
                    RpcResponse::Proxies(s.proxies.values().cloned().collect())
                })
                .await
            }
            RpcRequest::ListLaunchers => {
                self.gated_read(&RpcRequest::ListLaunchers, self.consistency.list_launchers, |s| {
                    RpcResponse::Launchers(s.launchers.values().cloned().collect())
                })
                .await
            }
            RpcRequest::ListPatterns => {
                self.gated_read(&RpcRequest::ListPatterns, self.consistency.list_patterns, |s| {
                    RpcResponse::Patterns(s.patterns.values().cloned().collect())
                })
                .await
            }
            RpcRequest::ReportLifecycleEvent(report) => {
                metrics::LIFECYCLE_EVENTS_TOTAL
                    .with_label_values(&[report.event.as_str()])
                    .inc();
                info!(
                    "Lifecycle event from launcher '{}': process '{}' is {} ({})",
                    report.launcher_id, report.process_id, report.event, report.message
                );
                if let Some(mirror) = self.fsm.mirror() {
                    mirror.write(MirrorOp::Audit {
                        command: "LIFECYCLE_EVENT".to_string(),
                        issuer: report.launcher_id,
                        timestamp: report.timestamp,
                        detail: format!(
                            "{} {} ({})",
                            report.process_id, report.event, report.message
                        ),
                    });
                }
                RpcResponse::Ack(GenericAck {
                    success: true,
                    message: "recorded".to_string(),
                })
            }
            RpcRequest::ClusterStatus => {
                let status = self.raft.status();
                let (last_applied_index, _) = self.fsm.last_applied();
                RpcResponse::ClusterStatus(ClusterStatusInfo {
                    node_id: status.node_id,
                    is_leader: status.is_leader,
                    leader_id: status.leader_id,
                    leader_address: self.raft.leader_rpc_address(),
                    term: status.term,
                    last_applied_index,
                    members: status.members,
                })
            }
        }
    }

    async fn register_proxy(
        self: &Arc<Self>,
        cmd: crate::core::commands::RegisterProxyCmd,
    ) -> RpcResponse {
        let proxy_id = cmd.proxy_id.clone();
        let command = Command::new(proxy_id.clone(), CommandPayload::RegisterProxy(cmd));
        let outcome = match self.raft.propose(command).await {
            Ok(outcome) => outcome,
            Err(e) => return RpcResponse::error(&e),
        };

        // Derived response fields are read under stale consistency.
        metrics::READS_TOTAL.with_label_values(&["stale"]).inc();
        let (ranges, namespaces) = self.fsm.read(|s| {
            let range = partition::compute_ranges(&proxy_id, &s.proxies);
            let namespaces = range
                .map(|r| {
                    s.namespaces
                        .values()
                        .filter(|ns| r.contains(ns.partition_id))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            (range.into_iter().collect::<Vec<_>>(), namespaces)
        });

        RpcResponse::RegisterProxy(ProxyRegistrationAck {
            success: outcome.ok,
            message: outcome.message,
            initial_namespaces: namespaces,
            partition_ranges: ranges,
        })
    }

    async fn register_launcher(
        self: &Arc<Self>,
        cmd: crate::core::commands::RegisterLauncherCmd,
    ) -> RpcResponse {
        let launcher_id = cmd.launcher_id.clone();
        let command = Command::new(launcher_id.clone(), CommandPayload::RegisterLauncher(cmd));
        let outcome = match self.raft.propose(command).await {
            Ok(outcome) => outcome,
            Err(e) => return RpcResponse::error(&e),
        };

        metrics::READS_TOTAL.with_label_values(&["stale"]).inc();
        let (initial_processes, assigned_capacity) = self.fsm.read(|s| {
            let processes = s
                .patterns
                .values()
                .filter(|p| p.launcher_id == launcher_id)
                .cloned()
                .collect();
            let capacity = s
                .launchers
                .get(&launcher_id)
                .map(|l| l.max_processes)
                .unwrap_or(0);
            (processes, capacity)
        });

        RpcResponse::RegisterLauncher(LauncherRegistrationAck {
            success: outcome.ok,
            message: outcome.message,
            initial_processes,
            assigned_capacity,
        })
    }

    async fn create_namespace(self: &Arc<Self>, cmd: CreateNamespaceCmd) -> RpcResponse {
        let name = cmd.name.clone();
        if name.trim().is_empty() {
            return RpcResponse::error(&CitrineError::InvalidArgument(
                "namespace name cannot be empty".to_string(),
            ));
        }
        let command = Command::new(cmd.created_by.clone(), CommandPayload::CreateNamespace(cmd));
        let outcome = match self.raft.propose(command).await {
            Ok(outcome) => outcome,
            Err(e) => return RpcResponse::error(&e),
        };

        let ns = self.fsm.read(|s| s.namespaces.get(&name).cloned());
        match ns {
            Some(ns) => RpcResponse::CreateNamespace(CreateNamespaceAck {
                success: outcome.ok,
                message: outcome.message,
                assigned_partition: ns.partition_id,
                assigned_proxy: ns.assigned_proxy,
            }),
            None => RpcResponse::error(&CitrineError::Internal(format!(
                "namespace '{name}' missing after apply"
            ))),
        }
    }

    /// Leader path for heartbeats: propose the status update and report the
    /// apply outcome.
    async fn propose_heartbeat(self: &Arc<Self>, command: Command) -> RpcResponse {
        match self.raft.propose(command).await {
            Ok(outcome) => RpcResponse::Heartbeat(HeartbeatAck {
                success: outcome.ok,
                server_timestamp: now_secs(),
            }),
            Err(e) => RpcResponse::error(&e),
        }
    }

    /// Follower path for heartbeats: acknowledge the caller immediately and
    /// forward in the background. The forward runs under an ambient scope,
    /// detached from the caller's deadline.
    fn ack_and_forward_heartbeat(self: &Arc<Self>, req: RpcRequest) -> RpcResponse {
        let origin = match &req {
            RpcRequest::Heartbeat(_) => "proxy",
            _ => "launcher",
        };
        metrics::HEARTBEATS_TOTAL.with_label_values(&[origin]).inc();

        let service = self.clone();
        tokio::spawn(async move {
            let response = service.forward_to_leader(&req).await;
            if let RpcResponse::Error(failure) = response {
                debug!(
                    "Async heartbeat forward failed ({:?}): {}",
                    failure.code, failure.message
                );
            }
        });

        RpcResponse::Heartbeat(HeartbeatAck {
            success: true,
            server_timestamp: now_secs(),
        })
    }

    /// Serves a read under its consistency tier; leader-only tiers forward
    /// from followers the same way writes do.
    async fn gated_read<F>(
        self: &Arc<Self>,
        req: &RpcRequest,
        tier: ReadConsistency,
        f: F,
    ) -> RpcResponse
    where
        F: FnOnce(&AdminState) -> RpcResponse,
    {
        metrics::READS_TOTAL.with_label_values(&[tier.as_str()]).inc();
        match tier {
            ReadConsistency::Stale => self.fsm.read(f),
            ReadConsistency::LeaseCheck => {
                if self.raft.lease_check() {
                    self.fsm.read(f)
                } else {
                    self.forward_to_leader(req).await
                }
            }
            ReadConsistency::Linearizable => {
                if self.raft.is_leader() {
                    match self.raft.ensure_linearizable().await {
                        Ok(()) => self.fsm.read(f),
                        Err(e) => RpcResponse::error(&e),
                    }
                } else {
                    self.forward_to_leader(req).await
                }
            }
        }
    }

    async fn forward_to_leader(&self, req: &RpcRequest) -> RpcResponse {
        let Some(leader_addr) = self.raft.leader_rpc_address() else {
            metrics::RPC_UNAVAILABLE_TOTAL.inc();
            return RpcResponse::unavailable("no leader is currently known");
        };
        match self.forwarder.forward(&leader_addr, req).await {
            Ok(response) => response,
            Err(e) => {
                metrics::RPC_UNAVAILABLE_TOTAL.inc();
                warn!("Forwarding {} to {} failed: {}", req.op_name(), leader_addr, e);
                RpcResponse::error(&e)
            }
        }
    }
}
