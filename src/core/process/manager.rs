// src/core/process/manager.rs

//! The per-process worker engine: one owning task per process, an immutable
//! forward-only state machine, pending/active update slots, and the work
//! queue gluing retries together.

use crate::core::errors::CitrineError;
use crate::core::metrics;
use crate::core::process::queue::{WorkQueue, exponential_backoff, jitter};
use crate::core::process::state::{
    ProcessConfig, ProcessState, ProcessUpdate, ProcessView, UpdateKind,
};
use crate::core::process::{
    LifecycleEvent, LifecycleEventKind, LifecycleEventSender, ProcessSyncer, StatusFn,
};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Tunables of the lifecycle engine.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Steady-state interval between health re-syncs.
    pub resync_interval: Duration,
    /// Ceiling of the exponential backoff applied to failing syncs.
    pub back_off_period: Duration,
    /// Grace period used when a Terminate carries none.
    pub default_grace_period: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            resync_interval: Duration::from_secs(30),
            back_off_period: Duration::from_secs(300),
            default_grace_period: Duration::from_secs(10),
        }
    }
}

/// Base delay for the retry ladder.
const RETRY_BASE: Duration = Duration::from_secs(1);

struct Slots {
    pending: Option<ProcessUpdate>,
    active: Option<ProcessUpdate>,
    state: ProcessState,
    working: bool,
    consecutive_fails: u32,
    grace_period: Duration,
    /// Per-process cancellation scope; replaced after each cancellation.
    /// Deliberately not a child of the manager root: terminating syncs must
    /// still run during shutdown.
    scope: CancellationToken,
}

struct ProcessHandle {
    id: String,
    signal_tx: mpsc::Sender<()>,
    slots: Mutex<Slots>,
}

struct ManagerInner {
    syncer: Arc<dyn ProcessSyncer>,
    queue: Arc<WorkQueue>,
    procs: Mutex<HashMap<String, Arc<ProcessHandle>>>,
    cfg: ManagerConfig,
    root: CancellationToken,
    consumer_stop: CancellationToken,
    events: Option<LifecycleEventSender>,
}

/// Supervises N concurrent local processes, one owning task per process.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<ManagerInner>,
}

impl ProcessManager {
    /// Creates the manager and starts the work-queue consumer.
    pub fn new(
        syncer: Arc<dyn ProcessSyncer>,
        cfg: ManagerConfig,
        events: Option<LifecycleEventSender>,
    ) -> Self {
        let inner = Arc::new(ManagerInner {
            syncer,
            queue: Arc::new(WorkQueue::new()),
            procs: Mutex::new(HashMap::new()),
            cfg,
            root: CancellationToken::new(),
            consumer_stop: CancellationToken::new(),
            events,
        });
        tokio::spawn(queue_consumer(inner.clone()));
        Self { inner }
    }

    /// Stores an update into the process's pending slot and signals its
    /// worker. The first-ever Create for an id spawns the worker in state
    /// `Starting`.
    pub fn update_process(&self, id: &str, update: ProcessUpdate) -> Result<(), CitrineError> {
        let handle = {
            let mut procs = self.inner.procs.lock();
            match procs.get(id).cloned() {
                Some(handle) => handle,
                None => {
                    if update.kind != UpdateKind::Create {
                        return Err(CitrineError::InvalidArgument(format!(
                            "process '{id}' is not managed"
                        )));
                    }
                    let (signal_tx, signal_rx) = mpsc::channel(1);
                    let handle = Arc::new(ProcessHandle {
                        id: id.to_string(),
                        signal_tx,
                        slots: Mutex::new(Slots {
                            pending: None,
                            active: None,
                            state: ProcessState::Starting,
                            working: false,
                            consecutive_fails: 0,
                            grace_period: self.inner.cfg.default_grace_period,
                            scope: CancellationToken::new(),
                        }),
                    });
                    procs.insert(id.to_string(), handle.clone());
                    tokio::spawn(worker(self.inner.clone(), handle.clone(), signal_rx));
                    handle
                }
            }
        };

        {
            let mut slots = handle.slots.lock();
            if slots.state == ProcessState::Finished {
                return Err(CitrineError::InvalidArgument(format!(
                    "process '{id}' has finished; remove it before re-creating"
                )));
            }
            if update.kind == UpdateKind::Terminate {
                // The grace period may only decrease across updates.
                let requested = update
                    .grace_period
                    .unwrap_or(self.inner.cfg.default_grace_period);
                slots.grace_period = slots.grace_period.min(requested);
                // Interrupt an in-flight sync so the stop is picked up
                // promptly.
                if slots.working && slots.state < ProcessState::Terminating {
                    slots.scope.cancel();
                }
            }
            slots.pending = Some(update);
        }
        let _ = handle.signal_tx.try_send(());
        Ok(())
    }

    pub fn queue(&self) -> Arc<WorkQueue> {
        self.inner.queue.clone()
    }

    pub fn state_of(&self, id: &str) -> Option<ProcessState> {
        let handle = self.inner.procs.lock().get(id).cloned()?;
        let state = handle.slots.lock().state;
        Some(state)
    }

    /// Snapshots every managed process.
    pub fn views(&self) -> Vec<ProcessView> {
        let handles: Vec<_> = self.inner.procs.lock().values().cloned().collect();
        handles
            .iter()
            .map(|h| {
                let slots = h.slots.lock();
                ProcessView {
                    process_id: h.id.clone(),
                    state: slots.state,
                    working: slots.working,
                    consecutive_fails: slots.consecutive_fails,
                }
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.procs.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The explicit external delete: removes an entry once it has reached
    /// `Finished`. Returns false when the process is unknown or still alive.
    pub fn remove_finished(&self, id: &str) -> bool {
        let mut procs = self.inner.procs.lock();
        let finished = match procs.get(id) {
            Some(handle) => handle.slots.lock().state == ProcessState::Finished,
            None => return false,
        };
        if !finished {
            return false;
        }
        procs.remove(id);
        true
    }

    /// Cancels the root scope, drives every process to `Terminate`, and
    /// waits for all of them to reach `Finished` within the deadline.
    pub async fn shutdown(&self, timeout: Duration) -> Result<(), CitrineError> {
        info!("Process manager shutting down {} process(es)", self.len());
        self.inner.root.cancel();

        let deadline = Instant::now() + timeout;
        loop {
            let all_finished = {
                let procs = self.inner.procs.lock();
                procs
                    .values()
                    .all(|h| h.slots.lock().state == ProcessState::Finished)
            };
            if all_finished {
                break;
            }
            if Instant::now() >= deadline {
                self.inner.consumer_stop.cancel();
                return Err(CitrineError::Cancelled(
                    "shutdown deadline exceeded before all processes finished".to_string(),
                ));
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.inner.consumer_stop.cancel();
        info!("Process manager shutdown complete.");
        Ok(())
    }
}

/// The one task that services all processes: drains ready ids and pokes the
/// owning workers.
async fn queue_consumer(inner: Arc<ManagerInner>) {
    let mut tick = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = inner.consumer_stop.cancelled() => {
                debug!("Work queue consumer stopping.");
                return;
            }
            _ = inner.queue.wait() => {}
            _ = tick.tick() => {}
        }
        while let Some(id) = inner.queue.dequeue() {
            let handle = inner.procs.lock().get(&id).cloned();
            if let Some(handle) = handle {
                let _ = handle.signal_tx.try_send(());
            }
        }
    }
}

enum WakeOutcome {
    Continue,
    Exit,
}

/// The owning task of one process.
async fn worker(
    inner: Arc<ManagerInner>,
    handle: Arc<ProcessHandle>,
    mut signal_rx: mpsc::Receiver<()>,
) {
    let mut root_seen = false;
    loop {
        if root_seen {
            if signal_rx.recv().await.is_none() {
                return;
            }
        } else {
            tokio::select! {
                _ = inner.root.cancelled() => {
                    root_seen = true;
                    inject_terminate(&inner, &handle);
                    continue;
                }
                msg = signal_rx.recv() => {
                    if msg.is_none() {
                        return;
                    }
                }
            }
        }

        if let WakeOutcome::Exit = handle_wake(&inner, &handle).await {
            set_process_gauges(&inner);
            return;
        }
        set_process_gauges(&inner);
    }
}

/// Queues a Terminate built from the process's last known config. Used when
/// the agent's root scope is cancelled.
fn inject_terminate(inner: &Arc<ManagerInner>, handle: &Arc<ProcessHandle>) {
    let mut slots = handle.slots.lock();
    if slots.state >= ProcessState::Terminating {
        return;
    }
    let config = slots
        .pending
        .as_ref()
        .or(slots.active.as_ref())
        .map(|u| u.config.clone());
    let Some(config) = config else {
        return;
    };
    if slots.working {
        slots.scope.cancel();
    }
    slots.pending = Some(ProcessUpdate::terminate(config, None));
    drop(slots);
    let _ = handle.signal_tx.try_send(());
}

async fn handle_wake(inner: &Arc<ManagerInner>, handle: &Arc<ProcessHandle>) -> WakeOutcome {
    // Steps 1-4 of the worker contract, under the slot lock.
    let (state, active, scope, grace_period, consecutive_fails) = {
        let mut slots = handle.slots.lock();
        if slots.state == ProcessState::Finished {
            return WakeOutcome::Exit;
        }
        if slots.working {
            // A prior signal will requeue once the in-flight sync returns.
            return WakeOutcome::Continue;
        }
        if let Some(pending) = slots.pending.take() {
            if pending.kind == UpdateKind::Terminate && slots.state < ProcessState::Terminating {
                slots.state = ProcessState::Terminating;
            }
            slots.active = Some(pending);
        }
        let Some(active) = slots.active.clone() else {
            return WakeOutcome::Continue;
        };
        slots.working = true;
        if slots.scope.is_cancelled() {
            slots.scope = CancellationToken::new();
        }
        (
            slots.state,
            active,
            slots.scope.clone(),
            slots.grace_period,
            slots.consecutive_fails,
        )
    };

    // Dispatch outside the lock; the syncer may block on I/O.
    let started = Instant::now();
    let step = match state {
        ProcessState::Starting | ProcessState::Syncing => {
            let kind = match active.kind {
                UpdateKind::Create => UpdateKind::Create,
                _ => UpdateKind::Update,
            };
            let result = inner
                .syncer
                .sync_process(&scope, kind, &active.config)
                .await;
            metrics::SYNC_LATENCY_SECONDS
                .with_label_values(&["sync"])
                .observe(started.elapsed().as_secs_f64());
            SyncStep::Progress(result)
        }
        ProcessState::Terminating => {
            let status: StatusFn = {
                let id = handle.id.clone();
                Arc::new(move |msg: &str| debug!("process '{}': {}", id, msg))
            };
            let result = inner
                .syncer
                .sync_terminating_process(&scope, &active.config, grace_period, status)
                .await;
            metrics::SYNC_LATENCY_SECONDS
                .with_label_values(&["terminating"])
                .observe(started.elapsed().as_secs_f64());
            SyncStep::Stopping(result)
        }
        ProcessState::Terminated => {
            let result = inner
                .syncer
                .sync_terminated_process(&scope, &active.config)
                .await;
            metrics::SYNC_LATENCY_SECONDS
                .with_label_values(&["terminated"])
                .observe(started.elapsed().as_secs_f64());
            SyncStep::Cleanup(result)
        }
        ProcessState::Finished => return WakeOutcome::Exit,
    };

    // Step 6: record the result, decide the requeue delay, re-signal.
    let mut requeue: Option<Duration> = None;
    let mut event: Option<(LifecycleEventKind, String)> = None;

    {
        let mut slots = handle.slots.lock();
        slots.working = false;

        match step {
            SyncStep::Progress(Ok(terminal)) => {
                if terminal {
                    metrics::CIRCUIT_BREAKER_TRIPS_TOTAL.inc();
                    warn!(
                        "Process '{}' hit the error ceiling; forcing termination",
                        handle.id
                    );
                    slots.state = ProcessState::Terminating;
                    event = Some((
                        LifecycleEventKind::Degraded,
                        "error ceiling reached; terminating".to_string(),
                    ));
                    requeue = Some(Duration::ZERO);
                } else {
                    if slots.state == ProcessState::Starting {
                        slots.state = ProcessState::Syncing;
                    }
                    if slots.consecutive_fails > 0 || state == ProcessState::Starting {
                        event = Some((LifecycleEventKind::Healthy, "sync succeeded".to_string()));
                    }
                    slots.consecutive_fails = 0;
                    requeue = Some(jitter(inner.cfg.resync_interval, 0.10));
                }
            }
            SyncStep::Stopping(Ok(())) => {
                slots.state = ProcessState::Terminated;
                slots.consecutive_fails = 0;
                // Immediate requeue so cleanup runs without delay.
                requeue = Some(Duration::ZERO);
            }
            SyncStep::Cleanup(Ok(())) => {
                slots.state = ProcessState::Finished;
                slots.consecutive_fails = 0;
            }
            SyncStep::Progress(Err(e)) | SyncStep::Stopping(Err(e)) | SyncStep::Cleanup(Err(e)) => {
                slots.consecutive_fails += 1;
                if e.is_transient() {
                    debug!(
                        "Transient sync failure for process '{}' (attempt {}): {}",
                        handle.id, slots.consecutive_fails, e
                    );
                    event = Some((LifecycleEventKind::Unhealthy, e.to_string()));
                    requeue = Some(jitter(RETRY_BASE, 0.50));
                } else {
                    warn!(
                        "Sync failure for process '{}' (attempt {}): {}",
                        handle.id, slots.consecutive_fails, e
                    );
                    event = Some((LifecycleEventKind::Restarting, e.to_string()));
                    requeue = Some(exponential_backoff(
                        consecutive_fails,
                        RETRY_BASE,
                        inner.cfg.back_off_period,
                    ));
                }
            }
        }
    }

    if let Some((kind, message)) = event {
        emit_event(inner, handle, kind, message, &active.config);
    }

    let finished = handle.slots.lock().state == ProcessState::Finished;
    if let Some(delay) = requeue {
        if !finished {
            inner.queue.enqueue(&handle.id, delay);
        }
    }
    if handle.slots.lock().pending.is_some() {
        let _ = handle.signal_tx.try_send(());
    }

    if finished {
        debug!("Process '{}' finished", handle.id);
        WakeOutcome::Exit
    } else {
        WakeOutcome::Continue
    }
}

enum SyncStep {
    Progress(Result<bool, CitrineError>),
    Stopping(Result<(), CitrineError>),
    Cleanup(Result<(), CitrineError>),
}

fn emit_event(
    inner: &Arc<ManagerInner>,
    handle: &Arc<ProcessHandle>,
    kind: LifecycleEventKind,
    message: String,
    config: &ProcessConfig,
) {
    metrics::LIFECYCLE_EVENTS_TOTAL
        .with_label_values(&[&kind.to_string()])
        .inc();
    if let Some(events) = &inner.events {
        let _ = events.send(LifecycleEvent {
            process_id: handle.id.clone(),
            pattern: config.pattern.clone(),
            kind,
            message,
        });
    }
}

fn set_process_gauges(inner: &Arc<ManagerInner>) {
    let mut counts: HashMap<ProcessState, usize> = HashMap::new();
    {
        let procs = inner.procs.lock();
        for handle in procs.values() {
            *counts.entry(handle.slots.lock().state).or_default() += 1;
        }
    }
    for state in [
        ProcessState::Starting,
        ProcessState::Syncing,
        ProcessState::Terminating,
        ProcessState::Terminated,
        ProcessState::Finished,
    ] {
        let count = counts.get(&state).copied().unwrap_or(0);
        metrics::PROCESSES
            .with_label_values(&[&state.to_string()])
            .set(count as f64);
    }
}
