// src/core/launcher/syncer.rs

//! The concrete pattern process syncer: fork/exec with the pattern contract
//! environment, HTTP readiness probing, liveness rechecks with a relaunch
//! path, and the graceful-then-forced stop sequence.

use crate::core::errors::CitrineError;
use crate::core::launcher::ports::{PortAllocator, PortPair};
use crate::core::metrics;
use crate::core::process::state::{ProcessConfig, UpdateKind};
use crate::core::process::{ProcessSyncer, StatusFn};
use crate::core::admin::state::now_secs;
use async_trait::async_trait;
use dashmap::DashMap;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Syncer tunables, all defaulted to the shipped profile.
#[derive(Debug, Clone)]
pub struct SyncerConfig {
    /// Interval between readiness probes while waiting for first health.
    pub probe_interval: Duration,
    /// Total budget for a pattern to become healthy after launch.
    pub probe_deadline: Duration,
    /// Per-probe HTTP timeout.
    pub probe_timeout: Duration,
    /// Wait after a force kill before declaring the reap failed.
    pub reap_timeout: Duration,
    /// The circuit breaker: at this error count a process is terminal.
    pub error_threshold: u32,
}

impl Default for SyncerConfig {
    fn default() -> Self {
        Self {
            probe_interval: Duration::from_millis(100),
            probe_deadline: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(5),
            reap_timeout: Duration::from_secs(5),
            error_threshold: 5,
        }
    }
}

/// Local, non-replicated state of one running pattern. Owned by the syncer's
/// tracking table; created on first successful launch; destroyed on cleanup.
#[derive(Debug, Clone)]
pub struct TrackedProcess {
    pub pid: u32,
    pub ports: PortPair,
    pub grpc_address: String,
    pub health_url: String,
    pub start_time: u64,
    pub restart_count: u32,
    pub error_count: u32,
    pub last_error: Option<String>,
    pub last_healthy: Option<u64>,
}

/// Launches and supervises pattern executables per the process contract.
pub struct PatternProcessSyncer {
    ports: Arc<PortAllocator>,
    http: reqwest::Client,
    table: DashMap<String, TrackedProcess>,
    cfg: SyncerConfig,
}

impl PatternProcessSyncer {
    pub fn new(ports: Arc<PortAllocator>, cfg: SyncerConfig) -> Self {
        Self {
            ports,
            http: reqwest::Client::new(),
            table: DashMap::new(),
            cfg,
        }
    }

    pub fn tracked(&self, process_id: &str) -> Option<TrackedProcess> {
        self.table.get(process_id).map(|r| r.clone())
    }

    /// Snapshot of all tracked pids, for the monitoring passes.
    pub fn tracked_pids(&self) -> Vec<(String, u32)> {
        self.table
            .iter()
            .map(|e| (e.key().clone(), e.value().pid))
            .collect()
    }

    /// signal-0 liveness probe.
    pub fn is_alive(pid: u32) -> bool {
        signal(pid, 0)
    }

    async fn launch(
        &self,
        config: &ProcessConfig,
        previous: Option<TrackedProcess>,
    ) -> Result<(), CitrineError> {
        let (ports, restart_count, error_count) = match &previous {
            Some(prev) => (prev.ports, prev.restart_count + 1, prev.error_count),
            None => (self.ports.allocate()?, 0, 0),
        };
        let health_url = format!("http://localhost:{}{}", ports.health, config.health_path);

        let mut command = tokio::process::Command::new(&config.executable);
        command
            .envs(&config.environment)
            .env("PATTERN_NAME", &config.pattern)
            .env("NAMESPACE", &config.namespace)
            .env("SESSION_ID", &config.session_id)
            .env("GRPC_PORT", ports.grpc.to_string())
            .env("HEALTH_PORT", ports.health.to_string())
            .env("PROCESS_ID", &config.process_id)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());

        let mut child = command.spawn().map_err(|e| {
            let msg = format!("spawn of '{}' failed: {e}", config.executable.display());
            if let Some(mut row) = self.table.get_mut(&config.process_id) {
                row.last_error = Some(msg.clone());
            }
            CitrineError::Launch(msg)
        })?;
        let pid = child
            .id()
            .ok_or_else(|| CitrineError::Launch("spawned process has no pid".to_string()))?;

        // Reap the child when it exits so no zombie lingers; lifecycle
        // decisions stay with the sync flow.
        tokio::spawn(async move {
            let _ = child.wait().await;
        });

        if restart_count > 0 {
            metrics::PROCESS_RESTARTS_TOTAL.inc();
        }
        info!(
            "Launched pattern '{}' as process '{}' (pid {}, grpc {}, health {})",
            config.pattern, config.process_id, pid, ports.grpc, ports.health
        );

        self.table.insert(
            config.process_id.clone(),
            TrackedProcess {
                pid,
                ports,
                grpc_address: format!("localhost:{}", ports.grpc),
                health_url,
                start_time: now_secs(),
                restart_count,
                error_count,
                last_error: None,
                last_healthy: None,
            },
        );
        Ok(())
    }

    /// Probes the health endpoint every `probe_interval` until 200 OK or the
    /// deadline passes.
    async fn wait_for_healthy(
        &self,
        scope: &CancellationToken,
        url: &str,
    ) -> Result<(), CitrineError> {
        let deadline = Instant::now() + self.cfg.probe_deadline;
        let mut ticker = tokio::time::interval(self.cfg.probe_interval);
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    return Err(CitrineError::Cancelled("health wait interrupted".to_string()));
                }
                _ = ticker.tick() => {
                    if self.probe_once(url).await {
                        return Ok(());
                    }
                    if Instant::now() >= deadline {
                        return Err(CitrineError::Health(format!(
                            "{url} did not return 200 within {:?}",
                            self.cfg.probe_deadline
                        )));
                    }
                }
            }
        }
    }

    async fn probe_once(&self, url: &str) -> bool {
        match self
            .http
            .get(url)
            .timeout(self.cfg.probe_timeout)
            .send()
            .await
        {
            Ok(resp) => resp.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Polls liveness until the pid disappears or the budget runs out.
    /// Returns true when the process exited.
    async fn wait_for_exit(
        &self,
        scope: &CancellationToken,
        pid: u32,
        budget: Duration,
    ) -> Result<bool, CitrineError> {
        let deadline = Instant::now() + budget;
        let mut ticker = tokio::time::interval(Duration::from_millis(100));
        loop {
            tokio::select! {
                _ = scope.cancelled() => {
                    return Err(CitrineError::Cancelled("stop wait interrupted".to_string()));
                }
                _ = ticker.tick() => {
                    if !Self::is_alive(pid) {
                        return Ok(true);
                    }
                    if Instant::now() >= deadline {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Kills the tracked process and launches a replacement, carrying the
    /// counters forward.
    async fn relaunch(
        &self,
        config: &ProcessConfig,
        previous: TrackedProcess,
    ) -> Result<(), CitrineError> {
        if Self::is_alive(previous.pid) {
            signal(previous.pid, libc::SIGKILL);
        }
        self.table.remove(&config.process_id);
        self.launch(config, Some(previous)).await
    }
}

#[async_trait]
impl ProcessSyncer for PatternProcessSyncer {
    async fn sync_process(
        &self,
        scope: &CancellationToken,
        _kind: UpdateKind,
        config: &ProcessConfig,
    ) -> Result<bool, CitrineError> {
        match self.tracked(&config.process_id) {
            None => {
                // First launch for this process id.
                self.launch(config, None).await?;
                let url = self
                    .tracked(&config.process_id)
                    .map(|t| t.health_url)
                    .unwrap_or_default();
                match self.wait_for_healthy(scope, &url).await {
                    Ok(()) => {
                        if let Some(mut row) = self.table.get_mut(&config.process_id) {
                            row.last_healthy = Some(now_secs());
                        }
                        Ok(false)
                    }
                    Err(e) => {
                        if let Some(mut row) = self.table.get_mut(&config.process_id) {
                            row.error_count += 1;
                            row.last_error = Some(e.to_string());
                        }
                        Err(e)
                    }
                }
            }
            Some(mut row) => {
                // Liveness recheck: signal-0, then a single probe.
                let healthy = Self::is_alive(row.pid) && self.probe_once(&row.health_url).await;
                if healthy {
                    row.last_healthy = Some(now_secs());
                    self.table.insert(config.process_id.clone(), row);
                    return Ok(false);
                }

                row.error_count += 1;
                row.last_error = Some("liveness recheck failed".to_string());
                debug!(
                    "Process '{}' (pid {}) failed its liveness recheck (error {}/{})",
                    config.process_id, row.pid, row.error_count, self.cfg.error_threshold
                );
                if row.error_count >= self.cfg.error_threshold {
                    self.table.insert(config.process_id.clone(), row);
                    return Ok(true);
                }
                self.table.insert(config.process_id.clone(), row.clone());

                self.relaunch(config, row).await?;
                let url = self
                    .tracked(&config.process_id)
                    .map(|t| t.health_url)
                    .unwrap_or_default();
                match self.wait_for_healthy(scope, &url).await {
                    Ok(()) => {
                        if let Some(mut r) = self.table.get_mut(&config.process_id) {
                            r.last_healthy = Some(now_secs());
                        }
                        Ok(false)
                    }
                    Err(e) => {
                        if let Some(mut r) = self.table.get_mut(&config.process_id) {
                            r.error_count += 1;
                            r.last_error = Some(e.to_string());
                        }
                        Err(e)
                    }
                }
            }
        }
    }

    async fn sync_terminating_process(
        &self,
        scope: &CancellationToken,
        config: &ProcessConfig,
        grace_period: Duration,
        status: StatusFn,
    ) -> Result<(), CitrineError> {
        let Some(row) = self.tracked(&config.process_id) else {
            // Nothing running; the stop is trivially complete.
            return Ok(());
        };
        if !Self::is_alive(row.pid) {
            return Ok(());
        }

        status("sending soft stop");
        signal(row.pid, libc::SIGTERM);
        if self.wait_for_exit(scope, row.pid, grace_period).await? {
            status("exited within grace");
            return Ok(());
        }

        status("grace expired; force killing");
        warn!(
            "Process '{}' (pid {}) ignored the soft stop; force killing",
            config.process_id, row.pid
        );
        signal(row.pid, libc::SIGKILL);
        if self.wait_for_exit(scope, row.pid, self.cfg.reap_timeout).await? {
            status("force kill reaped");
            return Ok(());
        }
        Err(CitrineError::GraceExpired(row.pid))
    }

    async fn sync_terminated_process(
        &self,
        _scope: &CancellationToken,
        config: &ProcessConfig,
    ) -> Result<(), CitrineError> {
        if let Some((_, row)) = self.table.remove(&config.process_id) {
            self.ports.release(row.ports);
            debug!(
                "Released tracking row and ports for process '{}'",
                config.process_id
            );
        }
        Ok(())
    }
}

/// Sends a signal to a pid. Signal 0 probes liveness. Returns true when the
/// signal was delivered.
#[cfg(unix)]
pub fn signal(pid: u32, sig: i32) -> bool {
    // SAFETY: kill(2) with a valid pid and signal number has no memory
    // safety implications.
    unsafe { libc::kill(pid as i32, sig) == 0 }
}

#[cfg(not(unix))]
pub fn signal(_pid: u32, _sig: i32) -> bool {
    false
}
