// src/core/raft/node.rs

//! The Raft node wrapper: bootstrap, propose, leader discovery, and the
//! periodic metrics sampler.

use super::network::BusNetworkFactory;
use super::storage::LogStore;
use super::{NodeId, RaftInstance};
use crate::config::{Config, rewrite_port};
use crate::core::admin::AdminFsm;
use crate::core::commands::{ApplyOutcome, Command};
use crate::core::errors::CitrineError;
use crate::core::metrics;
use openraft::error::{ClientWriteError, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, SnapshotPolicy};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Internal deadline on every Raft propose.
pub const PROPOSE_TIMEOUT: Duration = Duration::from_secs(3);

/// Cadence of the metrics sampling loop.
const METRICS_INTERVAL: Duration = Duration::from_secs(5);

/// A running Raft node bound to the admin FSM.
pub struct RaftNode {
    raft: RaftInstance,
    node_id: NodeId,
    peers: BTreeMap<NodeId, String>,
    rpc_port_offset: u16,
}

impl RaftNode {
    /// Creates the transport, stable + log store, and snapshot store, then
    /// starts the Raft library and its bus listener.
    pub async fn start(
        config: &Config,
        fsm: Arc<AdminFsm>,
        shutdown_tx: &broadcast::Sender<()>,
    ) -> Result<Arc<Self>, CitrineError> {
        let raft_config = openraft::Config {
            cluster_name: "citrine".to_string(),
            heartbeat_interval: config.raft.heartbeat_ms,
            election_timeout_min: config.raft.election_ms,
            election_timeout_max: config.raft.election_ms * 2,
            snapshot_policy: SnapshotPolicy::LogsSinceLast(config.snapshot_threshold),
            ..Default::default()
        }
        .validate()
        .map_err(|e| CitrineError::Config(format!("invalid raft config: {e}")))?;

        let store = LogStore::new(&config.data_dir, fsm)?;
        let (log_store, state_machine) = Adaptor::new(store);

        let raft = openraft::Raft::new(
            config.node_id,
            Arc::new(raft_config),
            BusNetworkFactory,
            log_store,
            state_machine,
        )
        .await
        .map_err(|e| CitrineError::Raft(format!("failed to create Raft instance: {e}")))?;

        let bind_addr = format!("{}:{}", config.host, config.raft_port);
        tokio::spawn(bus_guard(bind_addr, raft.clone(), shutdown_tx.subscribe()));

        let node = Arc::new(Self {
            raft: raft.clone(),
            node_id: config.node_id,
            peers: config.peers.clone(),
            rpc_port_offset: config.rpc_port_offset,
        });

        tokio::spawn(metrics_loop(
            raft,
            config.node_id,
            shutdown_tx.subscribe(),
        ));

        info!(
            "Raft node {} started with {} peer(s)",
            config.node_id,
            node.peers.len()
        );
        Ok(node)
    }

    /// Installs the initial cluster configuration. Only the lowest-id peer
    /// issues the call so concurrent boots converge; an "already initialized"
    /// error is swallowed.
    pub async fn bootstrap(&self) {
        let members: BTreeMap<NodeId, BasicNode> = self
            .peers
            .iter()
            .map(|(id, addr)| (*id, BasicNode { addr: addr.clone() }))
            .collect();

        let min_id = self.peers.keys().min().copied().unwrap_or(self.node_id);
        if self.node_id != min_id {
            return;
        }
        if let Err(e) = self.raft.initialize(members).await {
            info!("Raft already initialized (ignoring on restart): {}", e);
        } else {
            info!("Raft cluster bootstrapped by node {}", self.node_id);
        }
    }

    /// Proposes one command through the Raft log and returns the FSM's
    /// outcome, under the fixed propose deadline.
    pub async fn propose(&self, cmd: Command) -> Result<ApplyOutcome, CitrineError> {
        metrics::PROPOSALS_TOTAL.inc();
        let started = Instant::now();

        let result = tokio::time::timeout(PROPOSE_TIMEOUT, self.raft.client_write(cmd)).await;
        metrics::PROPOSE_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        match result {
            Ok(Ok(resp)) => Ok(resp.data),
            Ok(Err(RaftError::APIError(ClientWriteError::ForwardToLeader(fwd)))) => {
                metrics::PROPOSE_FAILURES_TOTAL
                    .with_label_values(&["not_leader"])
                    .inc();
                Err(CitrineError::NotLeader(format!(
                    "current leader is {:?}",
                    fwd.leader_id
                )))
            }
            Ok(Err(e)) => {
                metrics::PROPOSE_FAILURES_TOTAL
                    .with_label_values(&["other"])
                    .inc();
                Err(CitrineError::Raft(e.to_string()))
            }
            Err(_) => {
                metrics::PROPOSE_FAILURES_TOTAL
                    .with_label_values(&["timeout"])
                    .inc();
                Err(CitrineError::ProposeTimeout(PROPOSE_TIMEOUT))
            }
        }
    }

    /// Returns true if this node currently holds leadership.
    pub fn is_leader(&self) -> bool {
        let m = self.raft.metrics().borrow().clone();
        m.current_leader == Some(self.node_id)
            && m.state == openraft::ServerState::Leader
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn leader_id(&self) -> Option<NodeId> {
        self.raft.metrics().borrow().current_leader
    }

    /// The raft bus address of the current leader, from the static peer set.
    pub fn leader_bus_address(&self) -> Option<String> {
        let leader = self.leader_id()?;
        self.peers.get(&leader).cloned()
    }

    /// The control-plane RPC address of the current leader: the bus address
    /// with the port rewritten by the configured fixed offset.
    pub fn leader_rpc_address(&self) -> Option<String> {
        let bus_addr = self.leader_bus_address()?;
        match rewrite_port(&bus_addr, self.rpc_port_offset) {
            Ok(addr) => Some(addr),
            Err(e) => {
                warn!("Failed to rewrite leader address '{}': {}", bus_addr, e);
                None
            }
        }
    }

    /// Blocks until some leader is known, or the timeout elapses.
    pub async fn wait_for_leader(&self, timeout: Duration) -> Result<NodeId, CitrineError> {
        let m = self
            .raft
            .wait(Some(timeout))
            .metrics(|m| m.current_leader.is_some(), "leader elected")
            .await
            .map_err(|e| CitrineError::Unavailable(format!("no leader elected: {e}")))?;
        m.current_leader
            .ok_or_else(|| CitrineError::Unavailable("no leader elected".to_string()))
    }

    /// Confirms this node's leadership with a quorum round-trip, the
    /// precondition for linearizable reads.
    pub async fn ensure_linearizable(&self) -> Result<(), CitrineError> {
        self.raft
            .ensure_linearizable()
            .await
            .map(|_| ())
            .map_err(|e| CitrineError::NotLeader(e.to_string()))
    }

    /// Lease-check read gate: leadership per the Raft library, which itself
    /// steps down when the leader lease is lost.
    pub fn lease_check(&self) -> bool {
        self.is_leader()
    }

    /// A point-in-time sample of the Raft metrics for the status RPC.
    pub fn status(&self) -> RaftStatus {
        let m = self.raft.metrics().borrow().clone();
        RaftStatus {
            node_id: self.node_id,
            is_leader: m.current_leader == Some(self.node_id),
            leader_id: m.current_leader,
            term: m.current_term,
            last_log_index: m.last_log_index,
            last_applied_index: m.last_applied.map(|l| l.index),
            members: self.peers.len() as u32,
        }
    }

    pub async fn shutdown(&self) {
        if let Err(e) = self.raft.shutdown().await {
            warn!("Raft shutdown returned an error: {:?}", e);
        }
    }
}

/// A point-in-time view of this node's Raft role and progress.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub node_id: NodeId,
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: u64,
    pub last_log_index: Option<u64>,
    pub last_applied_index: Option<u64>,
    pub members: u32,
}

async fn bus_guard(
    bind_addr: String,
    raft: RaftInstance,
    shutdown_rx: broadcast::Receiver<()>,
) {
    if let Err(e) = super::bus::serve(bind_addr, raft, shutdown_rx).await {
        warn!("Raft bus listener stopped with error: {}", e);
    }
}

/// Samples role, term, and last index every five seconds and counts leader
/// identity transitions.
async fn metrics_loop(
    raft: RaftInstance,
    node_id: NodeId,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(METRICS_INTERVAL);
    let mut last_leader: Option<NodeId> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Raft metrics loop shutting down.");
                return;
            }
            _ = interval.tick() => {
                let m = raft.metrics().borrow().clone();
                metrics::RAFT_IS_LEADER.set(if m.current_leader == Some(node_id) { 1.0 } else { 0.0 });
                metrics::RAFT_TERM.set(m.current_term as f64);
                metrics::RAFT_LAST_LOG_INDEX.set(m.last_log_index.unwrap_or(0) as f64);

                if m.current_leader != last_leader {
                    if m.current_leader.is_some() && last_leader.is_some() {
                        metrics::LEADER_CHANGES_TOTAL.inc();
                    }
                    if let Some(leader) = m.current_leader {
                        info!("Raft leader is now node {} (term {})", leader, m.current_term);
                    }
                    last_leader = m.current_leader;
                }
            }
        }
    }
}
