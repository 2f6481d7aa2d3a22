// src/server/initialization.rs

//! Handles the complete node initialization process: mirror store, admin
//! FSM, Raft, the control-plane listener, and the metrics exporter.

use super::context::ServerContext;
use super::metrics_server;
use crate::config::{Config, parse_db_urn};
use crate::core::admin::AdminFsm;
use crate::core::admin::mirror;
use crate::core::controlplane::ControlPlaneService;
use crate::core::raft::RaftNode;
use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tracing::{info, warn};

/// Budget for the initial leader election before the node starts serving
/// (follower service is still correct without one; writes forward).
const BOOT_LEADER_WAIT: Duration = Duration::from_secs(5);

/// Initializes all node components before starting the main loop.
pub async fn setup(config: Config) -> Result<ServerContext> {
    log_startup_info(&config);
    let (shutdown_tx, _) = broadcast::channel(1);

    let mirror_handle = match parse_db_urn(&config.db_urn) {
        Ok(target) => match mirror::spawn_writer(&target) {
            Ok(handle) => {
                info!("Mirror store ready at {}", config.db_urn);
                Some(handle)
            }
            Err(e) => {
                warn!(
                    "Mirror store unavailable ({}); continuing without it: {}",
                    config.db_urn, e
                );
                None
            }
        },
        Err(e) => {
            warn!("Invalid db_urn '{}': {}; mirror disabled", config.db_urn, e);
            None
        }
    };

    let fsm = Arc::new(AdminFsm::new(mirror_handle));
    info!("Admin state machine initialized.");

    let raft = RaftNode::start(&config, fsm.clone(), &shutdown_tx)
        .await
        .context("failed to start the Raft node")?;
    raft.bootstrap().await;

    match raft.wait_for_leader(BOOT_LEADER_WAIT).await {
        Ok(leader) => info!("Leader elected: node {}", leader),
        Err(e) => warn!(
            "No leader within {:?} ({}); serving as follower until one appears",
            BOOT_LEADER_WAIT, e
        ),
    }

    let service = Arc::new(ControlPlaneService::new(
        fsm,
        raft.clone(),
        config.read_consistency.clone(),
        config.max_staleness,
    ));

    let listener = TcpListener::bind(&config.control_plane_addr)
        .await
        .with_context(|| format!("cannot bind control plane on {}", config.control_plane_addr))?;
    info!("Control plane listening on {}", config.control_plane_addr);

    let mut background_tasks = JoinSet::new();
    if config.metrics.enabled {
        let port = config.metrics.port;
        let shutdown_rx = shutdown_tx.subscribe();
        background_tasks.spawn(async move {
            metrics_server::run_metrics_server(port, shutdown_rx).await;
            Ok(())
        });
    }

    Ok(ServerContext {
        service,
        raft,
        listener,
        shutdown_tx,
        background_tasks,
    })
}

/// Logs key configuration parameters at startup.
fn log_startup_info(config: &Config) {
    info!(
        "Node {} starting: raft bus {}:{}, {} peer(s), data dir '{}'",
        config.node_id,
        config.host,
        config.raft_port,
        config.peers.len(),
        config.data_dir
    );
    if config.peers.len() == 1 {
        info!("Single-node mode: this node will elect itself.");
    }
}
