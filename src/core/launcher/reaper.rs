// src/core/launcher/reaper.rs

//! The two periodic supervision passes started at agent boot: the orphan
//! reaper, which removes pattern processes the manager no longer tracks, and
//! the health monitor, which re-verifies liveness of tracked processes.

use crate::core::launcher::syncer::{PatternProcessSyncer, signal};
use crate::core::metrics;
use crate::core::process::{LifecycleEvent, LifecycleEventKind, LifecycleEventSender};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use sysinfo::{ProcessesToUpdate, System};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Delay between the soft stop and the force kill of an orphan.
const ORPHAN_KILL_DELAY: Duration = Duration::from_secs(5);

/// The environment marker every launched pattern carries.
const PATTERN_MARKER: &str = "PATTERN_NAME=";

/// Periodically enumerates OS processes whose environment carries the
/// pattern marker and stops any pid the syncer's table does not track.
///
/// On platforms without per-pid environment enumeration the scan comes back
/// empty and the pass is a no-op.
pub async fn run_orphan_reaper(
    syncer: Arc<PatternProcessSyncer>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Orphan reaper started (interval {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Orphan reaper shutting down.");
                return;
            }
            _ = ticker.tick() => {
                reap_orphans_once(&syncer).await;
            }
        }
    }
}

async fn reap_orphans_once(syncer: &Arc<PatternProcessSyncer>) {
    let tracked: HashSet<u32> = syncer.tracked_pids().into_iter().map(|(_, pid)| pid).collect();

    let orphans = match tokio::task::spawn_blocking(move || scan_for_orphans(&tracked)).await {
        Ok(orphans) => orphans,
        Err(e) => {
            warn!("Orphan scan task failed: {}", e);
            return;
        }
    };
    if orphans.is_empty() {
        return;
    }

    warn!("Found {} orphan pattern process(es)", orphans.len());
    for &pid in &orphans {
        debug!("Soft-stopping orphan pid {}", pid);
        signal(pid, libc::SIGTERM);
    }
    tokio::time::sleep(ORPHAN_KILL_DELAY).await;
    for &pid in &orphans {
        if PatternProcessSyncer::is_alive(pid) {
            warn!("Orphan pid {} survived the soft stop; force killing", pid);
            signal(pid, libc::SIGKILL);
        }
        metrics::ORPHANS_REAPED_TOTAL.inc();
    }
}

/// Enumerates processes carrying the pattern marker in their environment and
/// returns the pids the manager does not own.
fn scan_for_orphans(tracked: &HashSet<u32>) -> Vec<u32> {
    let own_pid = std::process::id();
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);

    let mut orphans = Vec::new();
    for (pid, process) in system.processes() {
        let pid = pid.as_u32();
        if pid == own_pid || tracked.contains(&pid) {
            continue;
        }
        let is_pattern = process
            .environ()
            .iter()
            .any(|entry| entry.to_string_lossy().starts_with(PATTERN_MARKER));
        if is_pattern {
            orphans.push(pid);
        }
    }
    orphans
}

/// Periodically signal-0s every tracked pid. A failure is logged and
/// reported; the normal sync flow performs the actual restart.
pub async fn run_health_monitor(
    syncer: Arc<PatternProcessSyncer>,
    events: Option<LifecycleEventSender>,
    interval: Duration,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    info!("Health monitor started (interval {:?})", interval);
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Health monitor shutting down.");
                return;
            }
            _ = ticker.tick() => {
                for (process_id, pid) in syncer.tracked_pids() {
                    if PatternProcessSyncer::is_alive(pid) {
                        continue;
                    }
                    metrics::HEALTH_CHECK_FAILURES_TOTAL.inc();
                    warn!(
                        "Tracked process '{}' (pid {}) is gone; the next sync will restart it",
                        process_id, pid
                    );
                    if let Some(events) = &events {
                        let _ = events.send(LifecycleEvent {
                            process_id: process_id.clone(),
                            pattern: String::new(),
                            kind: LifecycleEventKind::Crashed,
                            message: format!("pid {pid} no longer responds to signal 0"),
                        });
                    }
                }
            }
        }
    }
}
