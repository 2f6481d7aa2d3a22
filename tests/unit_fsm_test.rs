// Unit tests for the admin state machine's apply semantics.

use citrine::core::admin::AdminFsm;
use citrine::core::admin::partition::hash_namespace;
use citrine::core::admin::state::HealthStatus;
use citrine::core::commands::{
    AssignPatternCmd, Command, CommandPayload, CreateNamespaceCmd, RegisterLauncherCmd,
    RegisterProxyCmd, UpdateStatusCmd,
};

fn register_proxy_cmd(id: &str) -> Command {
    Command::new(
        id,
        CommandPayload::RegisterProxy(RegisterProxyCmd {
            proxy_id: id.to_string(),
            address: format!("{id}:8080"),
            region: "us-west-2".to_string(),
            version: "1.0.0".to_string(),
            capabilities: Default::default(),
            resources: Default::default(),
        }),
    )
}

fn register_launcher_cmd(id: &str, max: i32) -> Command {
    Command::new(
        id,
        CommandPayload::RegisterLauncher(RegisterLauncherCmd {
            launcher_id: id.to_string(),
            address: format!("{id}:9090"),
            region: "us-west-2".to_string(),
            version: "1.0.0".to_string(),
            process_types: Default::default(),
            max_processes: max,
            resources: Default::default(),
        }),
    )
}

fn assign_pattern_cmd(pattern_id: &str, launcher_id: &str) -> Command {
    Command::new(
        launcher_id,
        CommandPayload::AssignPattern(AssignPatternCmd {
            pattern_id: pattern_id.to_string(),
            pattern_type: "test-pattern".to_string(),
            launcher_id: launcher_id.to_string(),
            namespace: "tenant-a".to_string(),
            config: Default::default(),
        }),
    )
}

#[test]
fn register_proxy_inserts_and_upserts() {
    let fsm = AdminFsm::new(None);
    let outcome = fsm.apply(1, 1, &register_proxy_cmd("proxy-01"));
    assert!(outcome.ok);

    let (address, registered_at) = fsm.read(|s| {
        let p = s.proxies.get("proxy-01").unwrap();
        (p.address.clone(), p.registered_at)
    });
    assert_eq!(address, "proxy-01:8080");

    // Re-registration keeps the original registration time.
    fsm.apply(2, 1, &register_proxy_cmd("proxy-01"));
    fsm.read(|s| {
        assert_eq!(s.proxies.len(), 1);
        assert_eq!(s.proxies.get("proxy-01").unwrap().registered_at, registered_at);
    });
}

#[test]
fn last_applied_index_tracks_applies() {
    let fsm = AdminFsm::new(None);
    fsm.apply(7, 2, &register_proxy_cmd("a"));
    assert_eq!(fsm.last_applied(), (7, 2));
    fsm.apply(9, 2, &register_proxy_cmd("b"));
    assert_eq!(fsm.last_applied(), (9, 2));
}

#[test]
fn create_namespace_derives_partition_and_proxy() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_proxy_cmd("proxy-01"));

    let cmd = Command::new(
        "admin",
        CommandPayload::CreateNamespace(CreateNamespaceCmd {
            name: "tenant-a".to_string(),
            config: Default::default(),
            created_by: "admin".to_string(),
            assigned_proxy: None,
        }),
    );
    let outcome = fsm.apply(2, 1, &cmd);
    assert!(outcome.ok);

    fsm.read(|s| {
        let ns = s.namespaces.get("tenant-a").unwrap();
        assert_eq!(ns.partition_id, hash_namespace("tenant-a"));
        // The only registered proxy owns every partition.
        assert_eq!(ns.assigned_proxy, "proxy-01");
        assert_eq!(ns.created_by, "admin");
    });
}

#[test]
fn create_namespace_update_keeps_persisted_placement() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_proxy_cmd("proxy-01"));
    let create = Command::new(
        "admin",
        CommandPayload::CreateNamespace(CreateNamespaceCmd {
            name: "tenant-a".to_string(),
            config: Default::default(),
            created_by: "admin".to_string(),
            assigned_proxy: None,
        }),
    );
    fsm.apply(2, 1, &create);
    let before = fsm.read(|s| s.namespaces.get("tenant-a").unwrap().clone());

    // New proxies shift the computed ranges, but a config-only update must
    // not move the persisted placement.
    fsm.apply(3, 1, &register_proxy_cmd("proxy-00"));
    let update = Command::new(
        "admin",
        CommandPayload::CreateNamespace(CreateNamespaceCmd {
            name: "tenant-a".to_string(),
            config: [("k".to_string(), "v".to_string())].into(),
            created_by: "admin".to_string(),
            assigned_proxy: None,
        }),
    );
    fsm.apply(4, 1, &update);

    fsm.read(|s| {
        let ns = s.namespaces.get("tenant-a").unwrap();
        assert_eq!(ns.assigned_proxy, before.assigned_proxy);
        assert_eq!(ns.partition_id, before.partition_id);
        assert_eq!(ns.config.get("k").map(String::as_str), Some("v"));
        assert_eq!(ns.created_at, before.created_at);
    });
}

#[test]
fn assign_pattern_decrements_slots_once() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_launcher_cmd("launcher-01", 4));

    fsm.apply(2, 1, &assign_pattern_cmd("pat-1", "launcher-01"));
    fsm.read(|s| {
        assert_eq!(s.launchers.get("launcher-01").unwrap().available_slots, 3)
    });

    // Replaying the same assignment is an upsert; no second decrement.
    fsm.apply(3, 1, &assign_pattern_cmd("pat-1", "launcher-01"));
    fsm.read(|s| {
        assert_eq!(s.launchers.get("launcher-01").unwrap().available_slots, 3);
        assert_eq!(s.patterns.len(), 1);
    });
}

#[test]
fn available_slots_floor_at_zero() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_launcher_cmd("launcher-01", 1));
    fsm.apply(2, 1, &assign_pattern_cmd("pat-1", "launcher-01"));
    fsm.apply(3, 1, &assign_pattern_cmd("pat-2", "launcher-01"));
    fsm.apply(4, 1, &assign_pattern_cmd("pat-3", "launcher-01"));
    fsm.read(|s| {
        assert_eq!(s.launchers.get("launcher-01").unwrap().available_slots, 0)
    });
}

#[test]
fn apply_is_idempotent_under_replay() {
    let build = |fsm: &AdminFsm, replay: bool| {
        fsm.apply(1, 1, &register_proxy_cmd("proxy-01"));
        fsm.apply(2, 1, &register_launcher_cmd("launcher-01", 8));
        let assign = assign_pattern_cmd("pat-1", "launcher-01");
        fsm.apply(3, 1, &assign);
        if replay {
            fsm.apply(3, 1, &assign);
        }
    };

    let once = AdminFsm::new(None);
    build(&once, false);
    let twice = AdminFsm::new(None);
    build(&twice, true);

    let a = once.read(|s| (s.patterns.clone(), s.launchers.get("launcher-01").unwrap().available_slots));
    let b = twice.read(|s| (s.patterns.clone(), s.launchers.get("launcher-01").unwrap().available_slots));
    assert_eq!(a.1, b.1);
    assert_eq!(a.0.len(), b.0.len());
}

#[test]
fn status_update_for_unknown_target_is_an_error_marker() {
    let fsm = AdminFsm::new(None);
    let cmd = Command::new(
        "ghost",
        CommandPayload::UpdateProxyStatus(UpdateStatusCmd {
            target_id: "ghost".to_string(),
            status: HealthStatus::Healthy,
            resources: None,
            available_slots: None,
        }),
    );
    let outcome = fsm.apply(1, 1, &cmd);
    assert!(!outcome.ok);
    assert!(outcome.message.contains("not registered"));
    // The entry is still committed: last_applied advanced, state unchanged.
    assert_eq!(fsm.last_applied().0, 1);
    fsm.read(|s| assert!(s.proxies.is_empty()));
}

#[test]
fn status_update_refreshes_known_targets() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_launcher_cmd("launcher-01", 8));
    let cmd = Command::new(
        "launcher-01",
        CommandPayload::UpdateLauncherStatus(UpdateStatusCmd {
            target_id: "launcher-01".to_string(),
            status: HealthStatus::Unhealthy,
            resources: None,
            available_slots: Some(2),
        }),
    );
    let outcome = fsm.apply(2, 1, &cmd);
    assert!(outcome.ok);
    fsm.read(|s| {
        let l = s.launchers.get("launcher-01").unwrap();
        assert_eq!(l.status, HealthStatus::Unhealthy);
        assert_eq!(l.available_slots, 2);
    });
}

#[test]
fn launcher_slots_clamp_to_max() {
    let fsm = AdminFsm::new(None);
    fsm.apply(1, 1, &register_launcher_cmd("launcher-01", 4));
    let cmd = Command::new(
        "launcher-01",
        CommandPayload::UpdateLauncherStatus(UpdateStatusCmd {
            target_id: "launcher-01".to_string(),
            status: HealthStatus::Healthy,
            resources: None,
            available_slots: Some(99),
        }),
    );
    fsm.apply(2, 1, &cmd);
    fsm.read(|s| {
        assert_eq!(s.launchers.get("launcher-01").unwrap().available_slots, 4)
    });
}
