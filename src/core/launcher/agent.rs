// src/core/launcher/agent.rs

//! The launcher agent runtime: registers with the control plane, heartbeats,
//! reports lifecycle events, and hosts the process and isolation managers.

use crate::config::LauncherConfig;
use crate::core::admin::state::{HealthStatus, PatternAssignment, now_secs};
use crate::core::commands::RegisterLauncherCmd;
use crate::core::controlplane::ControlPlaneClient;
use crate::core::controlplane::protocol::{
    LauncherHeartbeatRequest, LifecycleEventReport, RpcRequest, RpcResponse,
};
use crate::core::launcher::isolation::{IsolationManager, LaunchRequest};
use crate::core::launcher::manifest::ManifestSet;
use crate::core::launcher::ports::PortAllocator;
use crate::core::launcher::reaper;
use crate::core::launcher::syncer::{PatternProcessSyncer, SyncerConfig};
use crate::core::process::state::ProcessState;
use crate::core::process::{LifecycleEvent, ManagerConfig, ProcessManager};
use crate::server::await_shutdown_signal;
use anyhow::{Context, Result, anyhow};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

const INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// The main entry point for launcher agent mode.
pub async fn run(config_path: &str) -> Result<()> {
    let config = LauncherConfig::from_file(config_path)?;
    info!(
        "Launcher agent '{}' starting (manifests in '{}', capacity {})",
        config.launcher_id, config.manifest_dir, config.max_processes
    );

    let manifests = Arc::new(
        ManifestSet::load_dir(Path::new(&config.manifest_dir))
            .with_context(|| format!("failed to load manifests from '{}'", config.manifest_dir))?,
    );
    if manifests.is_empty() {
        warn!("No pattern manifests found; the agent will register with an empty catalog.");
    }

    let ports = Arc::new(PortAllocator::new(config.base_grpc_port));
    let syncer = Arc::new(PatternProcessSyncer::new(ports, SyncerConfig::default()));
    let (events_tx, events_rx) = mpsc::unbounded_channel::<LifecycleEvent>();
    let monitor_events = events_tx.clone();

    let manager = ProcessManager::new(
        syncer.clone(),
        ManagerConfig {
            resync_interval: config.resync_interval,
            back_off_period: config.back_off_period,
            default_grace_period: config.default_grace_period,
        },
        Some(events_tx),
    );
    let isolation = Arc::new(IsolationManager::new(manager.clone(), manifests.clone()));

    let (shutdown_tx, _) = broadcast::channel(1);

    // Periodic supervision passes.
    tokio::spawn(reaper::run_orphan_reaper(
        syncer.clone(),
        config.orphan_reap_interval,
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(reaper::run_health_monitor(
        syncer.clone(),
        Some(monitor_events),
        config.health_monitor_interval,
        shutdown_tx.subscribe(),
    ));

    if config.metrics.enabled {
        let port = config.metrics.port;
        let shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            crate::server::run_metrics_server(port, shutdown_rx).await;
        });
    }

    // Register, then start whatever the control plane already assigned here.
    let initial = register_with_retry(&config, &manifests, shutdown_tx.subscribe()).await?;
    start_initial_processes(&isolation, initial).await;

    tokio::spawn(heartbeat_loop(
        config.clone(),
        manager.clone(),
        shutdown_tx.subscribe(),
    ));
    tokio::spawn(lifecycle_reporter(
        config.clone(),
        events_rx,
        shutdown_tx.subscribe(),
    ));

    await_shutdown_signal().await;

    info!("Launcher agent shutting down.");
    let _ = shutdown_tx.send(());
    match manager.shutdown(config.shutdown_timeout).await {
        Ok(()) => info!("All processes stopped."),
        Err(e) => error!(
            "Shutdown incomplete within {:?}: {}",
            config.shutdown_timeout, e
        ),
    }
    Ok(())
}

async fn connect_any(endpoints: &[String]) -> Option<ControlPlaneClient> {
    for addr in endpoints {
        match ControlPlaneClient::connect(addr).await {
            Ok(client) => return Some(client),
            Err(e) => warn!("Control plane endpoint {} unreachable: {}", addr, e),
        }
    }
    None
}

/// Registers with the control plane, retrying under exponential backoff
/// until it succeeds or shutdown is requested.
async fn register_with_retry(
    config: &LauncherConfig,
    manifests: &Arc<ManifestSet>,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> Result<Vec<PatternAssignment>> {
    let request = RpcRequest::RegisterLauncher(RegisterLauncherCmd {
        launcher_id: config.launcher_id.clone(),
        address: config.address.clone(),
        region: config.region.clone(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        process_types: manifests.names().into_iter().collect(),
        max_processes: config.max_processes,
        resources: BTreeMap::new(),
    });

    let mut delay = INITIAL_RECONNECT_DELAY;
    loop {
        if let Some(mut client) = connect_any(&config.control_plane_endpoints).await {
            match client.call(&request).await {
                Ok(RpcResponse::RegisterLauncher(ack)) if ack.success => {
                    info!(
                        "Registered with the control plane: capacity {}, {} initial process(es)",
                        ack.assigned_capacity,
                        ack.initial_processes.len()
                    );
                    return Ok(ack.initial_processes);
                }
                Ok(RpcResponse::RegisterLauncher(ack)) => {
                    warn!("Registration rejected: {}", ack.message);
                }
                Ok(RpcResponse::Error(failure)) => {
                    warn!("Registration failed ({:?}): {}", failure.code, failure.message);
                }
                Ok(other) => {
                    warn!("Unexpected registration response: {:?}", other);
                }
                Err(e) => warn!("Registration call failed: {}", e),
            }
        }

        tokio::select! {
            _ = shutdown_rx.recv() => return Err(anyhow!("shutdown requested during registration")),
            _ = tokio::time::sleep(delay) => {}
        }
        // Apply exponential backoff for subsequent attempts.
        delay = (delay * 2).min(MAX_RECONNECT_DELAY);
    }
}

/// Brings up every pattern the control plane already assigned to this
/// launcher. Individual failures are logged; the work queue retries.
async fn start_initial_processes(
    isolation: &Arc<IsolationManager>,
    assignments: Vec<PatternAssignment>,
) {
    for assignment in assignments {
        let request = LaunchRequest {
            pattern: assignment.pattern_type.clone(),
            namespace: assignment.namespace.clone(),
            session_id: String::new(),
            config: assignment.config.clone(),
        };
        match isolation.get_or_create_process(&request).await {
            Ok(outcome) => info!(
                "Initial assignment '{}' running as process '{}'",
                assignment.pattern_id, outcome.process_id
            ),
            Err(e) => warn!(
                "Initial assignment '{}' failed to start: {}",
                assignment.pattern_id, e
            ),
        }
    }
}

/// Reports capacity and health on a fixed cadence, reconnecting with backoff
/// when the control plane is unreachable.
async fn heartbeat_loop(
    config: LauncherConfig,
    manager: ProcessManager,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut ticker = tokio::time::interval(config.heartbeat_interval);
    let mut client: Option<ControlPlaneClient> = None;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Heartbeat loop shutting down.");
                return;
            }
            _ = ticker.tick() => {
                if client.is_none() {
                    client = connect_any(&config.control_plane_endpoints).await;
                }
                let Some(conn) = client.as_mut() else {
                    warn!("No control plane endpoint reachable; skipping heartbeat.");
                    continue;
                };

                let active = manager
                    .views()
                    .iter()
                    .filter(|v| v.state != ProcessState::Finished)
                    .count() as i32;
                let request = RpcRequest::LauncherHeartbeat(LauncherHeartbeatRequest {
                    launcher_id: config.launcher_id.clone(),
                    status: HealthStatus::Healthy,
                    available_slots: Some((config.max_processes - active).max(0)),
                    resources: Some(BTreeMap::from([(
                        "active_processes".to_string(),
                        active.to_string(),
                    )])),
                });
                match conn.call(&request).await {
                    Ok(RpcResponse::Heartbeat(ack)) if ack.success => {}
                    Ok(RpcResponse::Heartbeat(_)) => {
                        // The control plane does not know us; re-register on
                        // the next natural reconnect.
                        warn!("Heartbeat acknowledged but launcher is unknown upstream.");
                    }
                    Ok(other) => warn!("Unexpected heartbeat response: {:?}", other),
                    Err(e) => {
                        warn!("Heartbeat failed: {}", e);
                        client = None;
                    }
                }
            }
        }
    }
}

/// Drains lifecycle events and reports them upstream, best-effort. Delivery
/// failure is logged and never fatal.
async fn lifecycle_reporter(
    config: LauncherConfig,
    mut events_rx: mpsc::UnboundedReceiver<LifecycleEvent>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut client: Option<ControlPlaneClient> = None;

    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Lifecycle reporter shutting down.");
                return;
            }
            event = events_rx.recv() => {
                let Some(event) = event else { return };
                event
            }
        };

        if client.is_none() {
            client = connect_any(&config.control_plane_endpoints).await;
        }
        let Some(conn) = client.as_mut() else {
            warn!(
                "Dropping lifecycle event for '{}' ({}): no endpoint reachable",
                event.process_id, event.kind
            );
            continue;
        };

        let request = RpcRequest::ReportLifecycleEvent(LifecycleEventReport {
            launcher_id: config.launcher_id.clone(),
            process_id: event.process_id.clone(),
            pattern: event.pattern.clone(),
            event: event.kind.to_string(),
            message: event.message.clone(),
            timestamp: now_secs(),
        });
        if let Err(e) = conn.call(&request).await {
            warn!(
                "Lifecycle event for '{}' not delivered: {}",
                event.process_id, e
            );
            client = None;
        }
    }
}
