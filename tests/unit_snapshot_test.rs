// Snapshot round-trip tests for the admin state machine.

use citrine::core::admin::AdminFsm;
use citrine::core::admin::state::AdminSnapshot;
use citrine::core::commands::{
    AssignPatternCmd, Command, CommandPayload, CreateNamespaceCmd, RegisterLauncherCmd,
    RegisterProxyCmd,
};
use citrine::core::raft::storage::{decode_snapshot, encode_snapshot};

fn populated_fsm() -> AdminFsm {
    let fsm = AdminFsm::new(None);
    fsm.apply(
        1,
        1,
        &Command::new(
            "proxy-01",
            CommandPayload::RegisterProxy(RegisterProxyCmd {
                proxy_id: "proxy-01".to_string(),
                address: "proxy-01:8080".to_string(),
                region: "us-west-2".to_string(),
                version: "1.0.0".to_string(),
                capabilities: ["keyvalue".to_string()].into(),
                resources: [("cpu".to_string(), "4".to_string())].into(),
            }),
        ),
    );
    fsm.apply(
        2,
        1,
        &Command::new(
            "launcher-01",
            CommandPayload::RegisterLauncher(RegisterLauncherCmd {
                launcher_id: "launcher-01".to_string(),
                address: "launcher-01:9090".to_string(),
                region: "us-west-2".to_string(),
                version: "1.0.0".to_string(),
                process_types: ["test-pattern".to_string()].into(),
                max_processes: 16,
                resources: Default::default(),
            }),
        ),
    );
    fsm.apply(
        3,
        1,
        &Command::new(
            "admin",
            CommandPayload::CreateNamespace(CreateNamespaceCmd {
                name: "tenant-a".to_string(),
                config: [("ttl".to_string(), "60".to_string())].into(),
                created_by: "admin".to_string(),
                assigned_proxy: None,
            }),
        ),
    );
    fsm.apply(
        4,
        2,
        &Command::new(
            "launcher-01",
            CommandPayload::AssignPattern(AssignPatternCmd {
                pattern_id: "pat-1".to_string(),
                pattern_type: "test-pattern".to_string(),
                launcher_id: "launcher-01".to_string(),
                namespace: "tenant-a".to_string(),
                config: Default::default(),
            }),
        ),
    );
    fsm
}

#[test]
fn restore_reproduces_the_snapshotted_state() {
    let source = populated_fsm();
    let snapshot = source.snapshot();

    let target = AdminFsm::new(None);
    target.restore(snapshot.clone());

    let original = source.read(|s| s.clone());
    let restored = target.read(|s| s.clone());
    assert_eq!(original, restored);
    assert_eq!(target.last_applied(), (4, 2));
}

#[test]
fn snapshot_survives_the_wire_encoding() {
    let source = populated_fsm();
    let snapshot = source.snapshot();

    let bytes = encode_snapshot(&snapshot).unwrap();
    let decoded: AdminSnapshot = decode_snapshot(&bytes).unwrap();
    assert_eq!(decoded, snapshot);
}

#[test]
fn snapshot_carries_the_applied_position() {
    let source = populated_fsm();
    let snapshot = source.snapshot();
    assert_eq!(snapshot.last_applied_index, 4);
    assert_eq!(snapshot.last_applied_term, 2);
    assert!(snapshot.snapshot_time > 0);
}

#[test]
fn corrupt_snapshot_bytes_are_rejected() {
    assert!(decode_snapshot(b"not a snapshot").is_err());
}
