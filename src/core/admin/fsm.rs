// src/core/admin/fsm.rs

//! The deterministic admin state machine behind the Raft log: applies
//! committed commands, serves snapshots, and mirrors every successful apply
//! to the local durable store.

use crate::core::admin::mirror::{MirrorHandle, MirrorOp};
use crate::core::admin::partition;
use crate::core::admin::state::{
    AdminSnapshot, AdminState, HealthStatus, LauncherInfo, NamespaceInfo, PatternAssignment,
    ProxyInfo, now_secs,
};
use crate::core::commands::{
    ApplyOutcome, AssignPatternCmd, Command, CommandPayload, CreateNamespaceCmd,
    RegisterLauncherCmd, RegisterProxyCmd, UpdateStatusCmd,
};
use crate::core::metrics;
use parking_lot::RwLock;
use std::time::Instant;
use tracing::{debug, warn};

/// The replicated admin FSM. Single writer (Raft apply), concurrent readers.
/// The lock is never held across I/O; mirror writes are queued after the
/// write lock is released.
#[derive(Debug)]
pub struct AdminFsm {
    state: RwLock<AdminState>,
    mirror: Option<MirrorHandle>,
}

impl AdminFsm {
    pub fn new(mirror: Option<MirrorHandle>) -> Self {
        Self {
            state: RwLock::new(AdminState::default()),
            mirror,
        }
    }

    /// Applies one committed log entry. All handlers are idempotent under
    /// replay: they compare by primary key and upsert. An apply that commits
    /// but changes nothing (unknown status-update target) returns an error
    /// marker, never a Raft-level failure.
    pub fn apply(&self, index: u64, term: u64, cmd: &Command) -> ApplyOutcome {
        let started = Instant::now();
        let mut mirror_ops = Vec::new();

        let outcome = {
            let mut state = self.state.write();
            state.last_applied_index = index;
            state.last_applied_term = term;
            state.state_updated_at = now_secs();

            match &cmd.payload {
                CommandPayload::RegisterProxy(c) => {
                    Self::apply_register_proxy(&mut state, c, &mut mirror_ops)
                }
                CommandPayload::RegisterLauncher(c) => {
                    Self::apply_register_launcher(&mut state, c, &mut mirror_ops)
                }
                CommandPayload::CreateNamespace(c) => {
                    Self::apply_create_namespace(&mut state, c, &mut mirror_ops)
                }
                CommandPayload::AssignPattern(c) => {
                    Self::apply_assign_pattern(&mut state, c, &mut mirror_ops)
                }
                CommandPayload::UpdateProxyStatus(c) => {
                    Self::apply_update_proxy_status(&mut state, c, &mut mirror_ops)
                }
                CommandPayload::UpdateLauncherStatus(c) => {
                    Self::apply_update_launcher_status(&mut state, c, &mut mirror_ops)
                }
            }
        };

        metrics::FSM_APPLIES_TOTAL.with_label_values(&[cmd.kind()]).inc();
        if !outcome.ok {
            metrics::FSM_APPLY_ERRORS_TOTAL
                .with_label_values(&[cmd.kind()])
                .inc();
            warn!(
                "Apply of {} at index {} returned an error marker: {}",
                cmd.kind(),
                index,
                outcome.message
            );
        }
        metrics::FSM_APPLY_LATENCY_SECONDS.observe(started.elapsed().as_secs_f64());

        if let Some(mirror) = &self.mirror {
            mirror.write(MirrorOp::Audit {
                command: cmd.kind().to_string(),
                issuer: cmd.issuer.clone(),
                timestamp: cmd.timestamp,
                detail: outcome.message.clone(),
            });
            for op in mirror_ops {
                mirror.write(op);
            }
        }

        outcome
    }

    fn apply_register_proxy(
        state: &mut AdminState,
        cmd: &RegisterProxyCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        let now = now_secs();
        let entry = state
            .proxies
            .entry(cmd.proxy_id.clone())
            .and_modify(|p| {
                p.address = cmd.address.clone();
                p.region = cmd.region.clone();
                p.version = cmd.version.clone();
                p.capabilities = cmd.capabilities.clone();
                p.resources = cmd.resources.clone();
                p.status = HealthStatus::Healthy;
                p.last_seen = now;
            })
            .or_insert_with(|| ProxyInfo {
                proxy_id: cmd.proxy_id.clone(),
                address: cmd.address.clone(),
                region: cmd.region.clone(),
                version: cmd.version.clone(),
                capabilities: cmd.capabilities.clone(),
                status: HealthStatus::Healthy,
                last_seen: now,
                registered_at: now,
                resources: cmd.resources.clone(),
            });
        mirror_ops.push(MirrorOp::UpsertProxy(entry.clone()));
        debug!("Registered proxy '{}' at {}", cmd.proxy_id, cmd.address);
        ApplyOutcome::ok(format!("proxy '{}' registered", cmd.proxy_id))
    }

    fn apply_register_launcher(
        state: &mut AdminState,
        cmd: &RegisterLauncherCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        let now = now_secs();
        let entry = state
            .launchers
            .entry(cmd.launcher_id.clone())
            .and_modify(|l| {
                l.address = cmd.address.clone();
                l.region = cmd.region.clone();
                l.version = cmd.version.clone();
                l.process_types = cmd.process_types.clone();
                l.resources = cmd.resources.clone();
                l.status = HealthStatus::Healthy;
                l.last_seen = now;
                l.max_processes = cmd.max_processes;
                l.available_slots = l.available_slots.clamp(0, cmd.max_processes);
            })
            .or_insert_with(|| LauncherInfo {
                launcher_id: cmd.launcher_id.clone(),
                address: cmd.address.clone(),
                region: cmd.region.clone(),
                version: cmd.version.clone(),
                process_types: cmd.process_types.clone(),
                status: HealthStatus::Healthy,
                last_seen: now,
                registered_at: now,
                max_processes: cmd.max_processes,
                available_slots: cmd.max_processes,
                resources: cmd.resources.clone(),
            });
        mirror_ops.push(MirrorOp::UpsertLauncher(entry.clone()));
        debug!("Registered launcher '{}' at {}", cmd.launcher_id, cmd.address);
        ApplyOutcome::ok(format!("launcher '{}' registered", cmd.launcher_id))
    }

    fn apply_create_namespace(
        state: &mut AdminState,
        cmd: &CreateNamespaceCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        let now = now_secs();
        if let Some(existing) = state.namespaces.get_mut(&cmd.name) {
            existing.config = cmd.config.clone();
            if let Some(proxy) = &cmd.assigned_proxy {
                existing.assigned_proxy = proxy.clone();
            }
            existing.updated_at = now;
            mirror_ops.push(MirrorOp::UpsertNamespace(existing.clone()));
            return ApplyOutcome::ok(format!("namespace '{}' updated", cmd.name));
        }

        let partition_id = partition::hash_namespace(&cmd.name);
        let assigned_proxy = match &cmd.assigned_proxy {
            Some(proxy) => proxy.clone(),
            None => partition::get_proxy_for_partition(partition_id, &state.proxies)
                .ok()
                .flatten()
                .unwrap_or_default(),
        };
        let entry = NamespaceInfo {
            name: cmd.name.clone(),
            partition_id,
            assigned_proxy: assigned_proxy.clone(),
            config: cmd.config.clone(),
            created_by: cmd.created_by.clone(),
            created_at: now,
            updated_at: now,
        };
        mirror_ops.push(MirrorOp::UpsertNamespace(entry.clone()));
        state.namespaces.insert(cmd.name.clone(), entry);
        debug!(
            "Created namespace '{}' on partition {} served by '{}'",
            cmd.name, partition_id, assigned_proxy
        );
        ApplyOutcome::ok(format!(
            "namespace '{}' created on partition {partition_id}",
            cmd.name
        ))
    }

    fn apply_assign_pattern(
        state: &mut AdminState,
        cmd: &AssignPatternCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        let now = now_secs();
        if let Some(existing) = state.patterns.get_mut(&cmd.pattern_id) {
            existing.pattern_type = cmd.pattern_type.clone();
            existing.launcher_id = cmd.launcher_id.clone();
            existing.namespace = cmd.namespace.clone();
            existing.config = cmd.config.clone();
            existing.updated_at = now;
            mirror_ops.push(MirrorOp::UpsertPattern(existing.clone()));
            return ApplyOutcome::ok(format!("pattern '{}' updated", cmd.pattern_id));
        }

        // Slots are consumed only on first insertion of a new pattern_id,
        // which keeps replayed entries idempotent.
        if let Some(launcher) = state.launchers.get_mut(&cmd.launcher_id) {
            launcher.available_slots = (launcher.available_slots - 1).max(0);
            mirror_ops.push(MirrorOp::UpsertLauncher(launcher.clone()));
        }
        let entry = PatternAssignment {
            pattern_id: cmd.pattern_id.clone(),
            pattern_type: cmd.pattern_type.clone(),
            launcher_id: cmd.launcher_id.clone(),
            namespace: cmd.namespace.clone(),
            config: cmd.config.clone(),
            status: crate::core::admin::state::PatternStatus::Running,
            assigned_at: now,
            updated_at: now,
        };
        mirror_ops.push(MirrorOp::UpsertPattern(entry.clone()));
        state.patterns.insert(cmd.pattern_id.clone(), entry);
        ApplyOutcome::ok(format!(
            "pattern '{}' assigned to launcher '{}'",
            cmd.pattern_id, cmd.launcher_id
        ))
    }

    fn apply_update_proxy_status(
        state: &mut AdminState,
        cmd: &UpdateStatusCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        match state.proxies.get_mut(&cmd.target_id) {
            Some(proxy) => {
                proxy.status = cmd.status;
                proxy.last_seen = now_secs();
                if let Some(resources) = &cmd.resources {
                    proxy.resources = resources.clone();
                }
                mirror_ops.push(MirrorOp::UpsertProxy(proxy.clone()));
                ApplyOutcome::ok(format!("proxy '{}' status updated", cmd.target_id))
            }
            None => ApplyOutcome::error(format!("proxy '{}' not registered", cmd.target_id)),
        }
    }

    fn apply_update_launcher_status(
        state: &mut AdminState,
        cmd: &UpdateStatusCmd,
        mirror_ops: &mut Vec<MirrorOp>,
    ) -> ApplyOutcome {
        match state.launchers.get_mut(&cmd.target_id) {
            Some(launcher) => {
                launcher.status = cmd.status;
                launcher.last_seen = now_secs();
                if let Some(resources) = &cmd.resources {
                    launcher.resources = resources.clone();
                }
                if let Some(slots) = cmd.available_slots {
                    launcher.available_slots = slots.clamp(0, launcher.max_processes);
                }
                mirror_ops.push(MirrorOp::UpsertLauncher(launcher.clone()));
                ApplyOutcome::ok(format!("launcher '{}' status updated", cmd.target_id))
            }
            None => ApplyOutcome::error(format!("launcher '{}' not registered", cmd.target_id)),
        }
    }

    /// Deep-clones the entire state for the Raft snapshot sink.
    pub fn snapshot(&self) -> AdminSnapshot {
        let state = self.state.read();
        AdminSnapshot {
            last_applied_index: state.last_applied_index,
            last_applied_term: state.last_applied_term,
            snapshot_time: now_secs(),
            state: state.clone(),
        }
    }

    /// Atomically replaces the in-memory state from a decoded snapshot.
    pub fn restore(&self, snapshot: AdminSnapshot) {
        let mut state = self.state.write();
        *state = snapshot.state;
        state.last_applied_index = snapshot.last_applied_index;
        state.last_applied_term = snapshot.last_applied_term;
    }

    /// Runs a closure under the read lock. Callers must not perform I/O
    /// inside the closure.
    pub fn read<R>(&self, f: impl FnOnce(&AdminState) -> R) -> R {
        let state = self.state.read();
        f(&state)
    }

    pub fn last_applied(&self) -> (u64, u64) {
        let state = self.state.read();
        (state.last_applied_index, state.last_applied_term)
    }

    /// Direct access to the mirror handle, for append-only audit writes that
    /// bypass the replicated log (lifecycle event reports).
    pub fn mirror(&self) -> Option<&MirrorHandle> {
        self.mirror.as_ref()
    }
}
