// Unit tests for isolation-key derivation and singleton routing.

use async_trait::async_trait;
use citrine::core::errors::CitrineError;
use citrine::core::launcher::isolation::derive_process_id;
use citrine::core::launcher::manifest::ManifestSet;
use citrine::core::launcher::{IsolationLevel, IsolationManager, LaunchRequest};
use citrine::core::process::state::{ProcessConfig, UpdateKind};
use citrine::core::process::{ManagerConfig, ProcessManager, ProcessSyncer, StatusFn};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// A syncer that succeeds instantly; the isolation layer is what's under
/// test here.
struct NoopSyncer;

#[async_trait]
impl ProcessSyncer for NoopSyncer {
    async fn sync_process(
        &self,
        _scope: &CancellationToken,
        _kind: UpdateKind,
        _config: &ProcessConfig,
    ) -> Result<bool, CitrineError> {
        Ok(false)
    }

    async fn sync_terminating_process(
        &self,
        _scope: &CancellationToken,
        _config: &ProcessConfig,
        _grace_period: Duration,
        _status: StatusFn,
    ) -> Result<(), CitrineError> {
        Ok(())
    }

    async fn sync_terminated_process(
        &self,
        _scope: &CancellationToken,
        _config: &ProcessConfig,
    ) -> Result<(), CitrineError> {
        Ok(())
    }
}

fn manifest_dir(patterns: &[(&str, &str)]) -> TempDir {
    let dir = TempDir::new().unwrap();
    for (name, isolation) in patterns {
        let exe = dir.path().join(format!("{name}.sh"));
        fs::write(&exe, "#!/bin/sh\nsleep 60\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&exe, fs::Permissions::from_mode(0o755)).unwrap();
        }
        fs::write(
            dir.path().join(format!("{name}.yaml")),
            format!(
                "name: {name}\nversion: \"1.0.0\"\nexecutable: {name}.sh\nisolation_level: {isolation}\nhealthcheck:\n  port: 18080\n  path: /healthz\nenvironment:\n  BASE: manifest\n"
            ),
        )
        .unwrap();
    }
    dir
}

fn isolation_manager(dir: &Path) -> IsolationManager {
    let manifests = Arc::new(ManifestSet::load_dir(dir).unwrap());
    let manager = ProcessManager::new(Arc::new(NoopSyncer), ManagerConfig::default(), None);
    IsolationManager::new(manager, manifests)
}

#[test]
fn process_ids_are_deterministic_per_level() {
    let shared = derive_process_id("pat", IsolationLevel::None, "", "").unwrap();
    assert_eq!(shared, derive_process_id("pat", IsolationLevel::None, "x", "y").unwrap());

    let ns = derive_process_id("pat", IsolationLevel::Namespace, "tenant-a", "").unwrap();
    assert_eq!(
        ns,
        derive_process_id("pat", IsolationLevel::Namespace, "tenant-a", "ignored").unwrap()
    );
    assert_ne!(
        ns,
        derive_process_id("pat", IsolationLevel::Namespace, "tenant-b", "").unwrap()
    );

    let sess = derive_process_id("pat", IsolationLevel::Session, "tenant-a", "user-123").unwrap();
    assert_ne!(
        sess,
        derive_process_id("pat", IsolationLevel::Session, "tenant-a", "user-456").unwrap()
    );
}

#[test]
fn missing_key_components_are_rejected() {
    assert!(derive_process_id("pat", IsolationLevel::Namespace, "", "").is_err());
    assert!(derive_process_id("pat", IsolationLevel::Session, "", "user-1").is_err());
    assert!(derive_process_id("pat", IsolationLevel::Session, "tenant-a", "").is_err());
}

#[tokio::test]
async fn namespace_isolation_reuses_the_singleton() {
    let dir = manifest_dir(&[("test-pattern", "namespace")]);
    let isolation = isolation_manager(dir.path());

    let request = LaunchRequest {
        pattern: "test-pattern".to_string(),
        namespace: "tenant-a".to_string(),
        ..Default::default()
    };
    let first = isolation.get_or_create_process(&request).await.unwrap();
    assert!(first.created);
    let second = isolation.get_or_create_process(&request).await.unwrap();
    assert_eq!(first.process_id, second.process_id);
    assert!(!second.created);

    let other = isolation
        .get_or_create_process(&LaunchRequest {
            pattern: "test-pattern".to_string(),
            namespace: "tenant-b".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_ne!(other.process_id, first.process_id);
    assert!(other.created);
}

#[tokio::test]
async fn session_isolation_keys_on_the_session() {
    let dir = manifest_dir(&[("test-pattern", "session")]);
    let isolation = isolation_manager(dir.path());

    let user_123 = LaunchRequest {
        pattern: "test-pattern".to_string(),
        namespace: "tenant-a".to_string(),
        session_id: "user-123".to_string(),
        ..Default::default()
    };
    let first = isolation.get_or_create_process(&user_123).await.unwrap();
    let second = isolation.get_or_create_process(&user_123).await.unwrap();
    assert_eq!(first.process_id, second.process_id);

    let user_456 = LaunchRequest {
        session_id: "user-456".to_string(),
        ..user_123.clone()
    };
    let third = isolation.get_or_create_process(&user_456).await.unwrap();
    assert_ne!(third.process_id, first.process_id);
}

#[tokio::test]
async fn empty_namespace_is_rejected_for_namespace_isolation() {
    let dir = manifest_dir(&[("test-pattern", "namespace")]);
    let isolation = isolation_manager(dir.path());

    let err = isolation
        .get_or_create_process(&LaunchRequest {
            pattern: "test-pattern".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CitrineError::InvalidArgument(_)));
}

#[tokio::test]
async fn unknown_patterns_are_rejected() {
    let dir = manifest_dir(&[("test-pattern", "none")]);
    let isolation = isolation_manager(dir.path());

    let err = isolation
        .get_or_create_process(&LaunchRequest {
            pattern: "no-such-pattern".to_string(),
            ..Default::default()
        })
        .await
        .unwrap_err();
    assert!(matches!(err, CitrineError::InvalidArgument(_)));
}

#[tokio::test]
async fn concurrent_launches_share_one_process() {
    let dir = manifest_dir(&[("test-pattern", "namespace")]);
    let isolation = Arc::new(isolation_manager(dir.path()));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let isolation = isolation.clone();
        handles.push(tokio::spawn(async move {
            isolation
                .get_or_create_process(&LaunchRequest {
                    pattern: "test-pattern".to_string(),
                    namespace: "tenant-a".to_string(),
                    ..Default::default()
                })
                .await
                .unwrap()
        }));
    }
    let mut ids = Vec::new();
    let mut created = 0;
    for handle in handles {
        let outcome = handle.await.unwrap();
        if outcome.created {
            created += 1;
        }
        ids.push(outcome.process_id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1, "all launches must resolve to one process");
    assert_eq!(created, 1, "exactly one launch may create the process");
}
