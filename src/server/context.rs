// src/server/context.rs

use crate::core::controlplane::ControlPlaneService;
use crate::core::raft::RaftNode;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;

/// Holds all the initialized state required to run the node's main loop.
pub struct ServerContext {
    pub service: Arc<ControlPlaneService>,
    pub raft: Arc<RaftNode>,
    pub listener: TcpListener,
    pub shutdown_tx: broadcast::Sender<()>,
    pub background_tasks: JoinSet<Result<(), anyhow::Error>>,
}
