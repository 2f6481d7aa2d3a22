// Unit tests for the process lifecycle engine, driven by a mock syncer.

use async_trait::async_trait;
use citrine::core::errors::CitrineError;
use citrine::core::process::state::{ProcessConfig, ProcessState, ProcessUpdate, UpdateKind};
use citrine::core::process::{ManagerConfig, ProcessManager, ProcessSyncer, StatusFn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Call {
    Sync,
    Terminating(u64),
    Terminated,
}

#[derive(Default)]
struct MockSyncer {
    calls: Mutex<Vec<Call>>,
    /// Fail this many sync_process calls before succeeding.
    fail_first: AtomicU32,
    /// Return terminal=true on every sync_process call when set.
    terminal: std::sync::atomic::AtomicBool,
    /// Artificial latency inside sync_terminating_process.
    slow_stop: std::sync::atomic::AtomicBool,
}

impl MockSyncer {
    fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl ProcessSyncer for MockSyncer {
    async fn sync_process(
        &self,
        _scope: &CancellationToken,
        _kind: UpdateKind,
        _config: &ProcessConfig,
    ) -> Result<bool, CitrineError> {
        self.calls.lock().push(Call::Sync);
        if self
            .fail_first
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CitrineError::Launch("mock launch failure".to_string()));
        }
        Ok(self.terminal.load(Ordering::SeqCst))
    }

    async fn sync_terminating_process(
        &self,
        _scope: &CancellationToken,
        _config: &ProcessConfig,
        grace_period: Duration,
        status: StatusFn,
    ) -> Result<(), CitrineError> {
        self.calls.lock().push(Call::Terminating(grace_period.as_secs()));
        status("mock soft stop");
        if self.slow_stop.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        Ok(())
    }

    async fn sync_terminated_process(
        &self,
        _scope: &CancellationToken,
        _config: &ProcessConfig,
    ) -> Result<(), CitrineError> {
        self.calls.lock().push(Call::Terminated);
        Ok(())
    }
}

fn config_for(id: &str) -> ProcessConfig {
    ProcessConfig {
        process_id: id.to_string(),
        pattern: "test-pattern".to_string(),
        namespace: "tenant-a".to_string(),
        session_id: String::new(),
        executable: "/bin/true".into(),
        health_path: "/healthz".to_string(),
        environment: Default::default(),
    }
}

fn manager_with(syncer: Arc<MockSyncer>) -> ProcessManager {
    ProcessManager::new(
        syncer,
        ManagerConfig {
            resync_interval: Duration::from_secs(60),
            back_off_period: Duration::from_secs(10),
            default_grace_period: Duration::from_secs(10),
        },
        None,
    )
}

async fn wait_for_state(
    manager: &ProcessManager,
    id: &str,
    state: ProcessState,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if manager.state_of(id) == Some(state) {
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!(
                "process '{id}' never reached {state}; currently {:?}",
                manager.state_of(id)
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn lifecycle_walks_the_states_in_order() {
    let syncer = Arc::new(MockSyncer::default());
    let manager = manager_with(syncer.clone());

    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Syncing, Duration::from_secs(2)).await;

    manager
        .update_process("p1", ProcessUpdate::terminate(config_for("p1"), None))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Finished, Duration::from_secs(3)).await;

    // The dispatch order must be a prefix-ordered walk: every sync before
    // the first terminating call, every terminating before terminated.
    let calls = syncer.calls();
    let first_terminating = calls
        .iter()
        .position(|c| matches!(c, Call::Terminating(_)))
        .expect("terminating was called");
    let first_terminated = calls
        .iter()
        .position(|c| matches!(c, Call::Terminated))
        .expect("terminated was called");
    assert!(first_terminating < first_terminated);
    assert!(
        calls[..first_terminating].iter().all(|c| matches!(c, Call::Sync)),
        "no cleanup call may precede termination: {calls:?}"
    );
}

#[tokio::test]
async fn terminal_sync_trips_the_circuit_breaker() {
    let syncer = Arc::new(MockSyncer::default());
    syncer.terminal.store(true, Ordering::SeqCst);
    let manager = manager_with(syncer.clone());

    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();

    // A terminal verdict forces Terminating and the machine runs to
    // Finished without any external Terminate.
    wait_for_state(&manager, "p1", ProcessState::Finished, Duration::from_secs(3)).await;
    let calls = syncer.calls();
    assert!(calls.iter().any(|c| matches!(c, Call::Terminating(_))));
    assert!(calls.iter().any(|c| matches!(c, Call::Terminated)));
}

#[tokio::test]
async fn grace_period_only_decreases() {
    let syncer = Arc::new(MockSyncer::default());
    syncer.slow_stop.store(true, Ordering::SeqCst);
    let manager = manager_with(syncer.clone());

    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Syncing, Duration::from_secs(2)).await;

    manager
        .update_process(
            "p1",
            ProcessUpdate::terminate(config_for("p1"), Some(Duration::from_secs(8))),
        )
        .unwrap();
    // A later, larger grace period must be ignored.
    let _ = manager.update_process(
        "p1",
        ProcessUpdate::terminate(config_for("p1"), Some(Duration::from_secs(12))),
    );
    wait_for_state(&manager, "p1", ProcessState::Finished, Duration::from_secs(3)).await;

    for call in syncer.calls() {
        if let Call::Terminating(grace) = call {
            assert!(grace <= 8, "grace grew to {grace}s");
        }
    }
}

#[tokio::test]
async fn failed_syncs_are_retried_under_backoff() {
    let syncer = Arc::new(MockSyncer::default());
    syncer.fail_first.store(2, Ordering::SeqCst);
    let manager = manager_with(syncer.clone());

    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();

    // Two failures at ~1s and ~2s backoff, then success.
    wait_for_state(&manager, "p1", ProcessState::Syncing, Duration::from_secs(10)).await;
    let syncs = syncer
        .calls()
        .iter()
        .filter(|c| matches!(c, Call::Sync))
        .count();
    assert!(syncs >= 3, "expected at least 3 sync attempts, saw {syncs}");
}

#[tokio::test]
async fn shutdown_terminates_every_process() {
    let syncer = Arc::new(MockSyncer::default());
    let manager = manager_with(syncer.clone());

    for id in ["p1", "p2", "p3"] {
        manager
            .update_process(id, ProcessUpdate::create(config_for(id)))
            .unwrap();
    }
    for id in ["p1", "p2", "p3"] {
        wait_for_state(&manager, id, ProcessState::Syncing, Duration::from_secs(3)).await;
    }

    manager.shutdown(Duration::from_secs(5)).await.unwrap();
    for id in ["p1", "p2", "p3"] {
        assert_eq!(manager.state_of(id), Some(ProcessState::Finished));
    }
}

#[tokio::test]
async fn updates_for_unknown_processes_are_rejected() {
    let syncer = Arc::new(MockSyncer::default());
    let manager = manager_with(syncer);

    let err = manager
        .update_process("ghost", ProcessUpdate::terminate(config_for("ghost"), None))
        .unwrap_err();
    assert!(matches!(err, CitrineError::InvalidArgument(_)));
}

#[tokio::test]
async fn finished_entries_need_explicit_removal() {
    let syncer = Arc::new(MockSyncer::default());
    let manager = manager_with(syncer);

    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Syncing, Duration::from_secs(2)).await;
    manager
        .update_process("p1", ProcessUpdate::terminate(config_for("p1"), None))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Finished, Duration::from_secs(3)).await;

    // A fresh Create is refused until the entry is removed.
    assert!(manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .is_err());
    assert!(manager.remove_finished("p1"));
    assert_eq!(manager.state_of("p1"), None);
    manager
        .update_process("p1", ProcessUpdate::create(config_for("p1")))
        .unwrap();
    wait_for_state(&manager, "p1", ProcessState::Syncing, Duration::from_secs(2)).await;
}
