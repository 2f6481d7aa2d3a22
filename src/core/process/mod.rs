// src/core/process/mod.rs

//! The supervised process lifecycle manager: work queue, per-process worker
//! state machine, and the syncer seam the launcher agent plugs into.

pub mod manager;
pub mod queue;
pub mod state;

use crate::core::errors::CitrineError;
use async_trait::async_trait;
use state::{ProcessConfig, UpdateKind};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub use manager::{ManagerConfig, ProcessManager};
pub use queue::WorkQueue;
pub use state::{ProcessState, ProcessUpdate, ProcessView};

/// Callback handed to `sync_terminating_process` for progress reporting
/// during a stop.
pub type StatusFn = Arc<dyn Fn(&str) + Send + Sync>;

/// The syncer seam: the three operations the per-process worker dispatches
/// to. The concrete pattern syncer launches OS processes; tests plug in
/// doubles.
#[async_trait]
pub trait ProcessSyncer: Send + Sync + 'static {
    /// Create, update, or health-check the process. Idempotent. Returns
    /// `terminal = true` when the process must not be restarted again
    /// without explicit external action.
    async fn sync_process(
        &self,
        scope: &CancellationToken,
        kind: UpdateKind,
        config: &ProcessConfig,
    ) -> Result<bool, CitrineError>;

    /// Send a soft stop; wait within the grace period; force kill on expiry.
    /// Must not return until the OS process has observably exited or the
    /// grace expired.
    async fn sync_terminating_process(
        &self,
        scope: &CancellationToken,
        config: &ProcessConfig,
        grace_period: Duration,
        status: StatusFn,
    ) -> Result<(), CitrineError>;

    /// Release handles, port allocations, and tracking rows.
    async fn sync_terminated_process(
        &self,
        scope: &CancellationToken,
        config: &ProcessConfig,
    ) -> Result<(), CitrineError>;
}

/// Lifecycle events surfaced by the manager and monitoring passes, reported
/// upstream best-effort.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "lowercase")]
pub enum LifecycleEventKind {
    Crashed,
    Restarting,
    Healthy,
    Unhealthy,
    Degraded,
}

/// One lifecycle observation about a managed process.
#[derive(Debug, Clone)]
pub struct LifecycleEvent {
    pub process_id: String,
    pub pattern: String,
    pub kind: LifecycleEventKind,
    pub message: String,
}

pub type LifecycleEventSender = tokio::sync::mpsc::UnboundedSender<LifecycleEvent>;
