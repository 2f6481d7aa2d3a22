// Tests for the best-effort mirror store fed by FSM applies.

use citrine::config::MirrorTarget;
use citrine::core::admin::AdminFsm;
use citrine::core::admin::mirror::{MirrorStore, spawn_writer};
use citrine::core::commands::{Command, CommandPayload, CreateNamespaceCmd, RegisterProxyCmd};
use std::time::{Duration, Instant};
use tempfile::TempDir;

fn wait_until<T>(mut probe: impl FnMut() -> Option<T>, timeout: Duration) -> T {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        if Instant::now() >= deadline {
            panic!("mirror write never landed");
        }
        std::thread::sleep(Duration::from_millis(20));
    }
}

#[test]
fn applies_flow_through_to_the_mirror() {
    let dir = TempDir::new().unwrap();
    let target = MirrorTarget::File(
        dir.path()
            .join("mirror.db")
            .to_string_lossy()
            .to_string(),
    );
    let handle = spawn_writer(&target).unwrap();
    let fsm = AdminFsm::new(Some(handle));

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
                capabilities: Default::default(),
                resources: Default::default(),
            }),
        ),
    );
    fsm.apply(
        2,
        1,
        &Command::new(
            "admin",
            CommandPayload::CreateNamespace(CreateNamespaceCmd {
                name: "tenant-a".to_string(),
                config: Default::default(),
                created_by: "admin".to_string(),
                assigned_proxy: None,
            }),
        ),
    );

    let store = MirrorStore::open(&target).unwrap();
    let address = wait_until(
        || store.proxy_address("proxy-01").unwrap(),
        Duration::from_secs(5),
    );
    assert_eq!(address, "proxy-01:8080");

    let partition = wait_until(
        || store.namespace_partition("tenant-a").unwrap(),
        Duration::from_secs(5),
    );
    assert!((0..256).contains(&partition));

    // Every apply also leaves an audit row.
    let audits = wait_until(
        || {
            let n = store.audit_count().unwrap();
            (n >= 2).then_some(n)
        },
        Duration::from_secs(5),
    );
    assert!(audits >= 2);
}

#[test]
fn applies_succeed_regardless_of_mirror_visibility() {
    // The memory-target writer keeps its data in a private connection; the
    // FSM must not depend on the mirror in any way.
    let handle = spawn_writer(&MirrorTarget::Memory).unwrap();
    let fsm = AdminFsm::new(Some(handle));
    let outcome = fsm.apply(
        1,
        1,
        &Command::new(
            "proxy-01",
            CommandPayload::RegisterProxy(RegisterProxyCmd {
                proxy_id: "proxy-01".to_string(),
                address: "proxy-01:8080".to_string(),
                region: "r".to_string(),
                version: "1".to_string(),
                capabilities: Default::default(),
                resources: Default::default(),
            }),
        ),
    );
    assert!(outcome.ok);
    fsm.read(|s| assert!(s.proxies.contains_key("proxy-01")));
}
