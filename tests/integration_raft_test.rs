// Cluster integration tests: single-node write-then-read and three-node
// replication over the raft bus.

use citrine::config::{Config, MetricsConfig, MirrorTarget, RaftTimingConfig};
use citrine::core::admin::AdminFsm;
use citrine::core::admin::mirror::{MirrorStore, spawn_writer};
use citrine::core::commands::{Command, CommandPayload, RegisterProxyCmd};
use citrine::core::raft::RaftNode;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio::sync::broadcast;

fn test_config(node_id: u64, port: u16, peers: BTreeMap<u64, String>, data_dir: &TempDir) -> Config {
    Config {
        node_id,
        host: "127.0.0.1".to_string(),
        raft_port: port,
        advertise_addr: format!("127.0.0.1:{port}"),
        peers,
        data_dir: data_dir.path().to_string_lossy().to_string(),
        log_level: "info".to_string(),
        snapshot_threshold: 10_000,
        raft: RaftTimingConfig {
            heartbeat_ms: 100,
            election_ms: 300,
            leader_lease_ms: 50,
            commit_ms: 50,
        },
        rpc_port_offset: 1000,
        control_plane_addr: format!("127.0.0.1:{}", port + 1000),
        admin_addr: format!("127.0.0.1:{}", port + 1000),
        db_urn: "sqlite::memory:".to_string(),
        max_staleness: Duration::from_millis(200),
        read_consistency: Default::default(),
        metrics: MetricsConfig::default(),
    }
}

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

/// Spread ports across runs to dodge lingering sockets from earlier tests.
fn port_base(lane: u16) -> u16 {
    20_000 + lane * 1_000 + (std::process::id() % 500) as u16
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn single_node_write_then_read() {
    let dir = TempDir::new().unwrap();
    let port = port_base(1);
    let peers = BTreeMap::from([(1, format!("127.0.0.1:{port}"))]);
    let config = test_config(1, port, peers, &dir);

    let mirror_path = dir.path().join("mirror.db").to_string_lossy().to_string();
    let mirror_target = MirrorTarget::File(mirror_path);
    let mirror = spawn_writer(&mirror_target).unwrap();
    let fsm = Arc::new(AdminFsm::new(Some(mirror)));

    let (shutdown_tx, _) = broadcast::channel(1);
    let raft = RaftNode::start(&config, fsm.clone(), &shutdown_tx)
        .await
        .unwrap();
    raft.bootstrap().await;
    raft.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!(raft.is_leader());

    let outcome = raft.propose(register_proxy_cmd("proxy-01")).await.unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    // The apply is visible locally as soon as the propose returns.
    let address = fsm.read(|s| s.proxies.get("proxy-01").map(|p| p.address.clone()));
    assert_eq!(address.as_deref(), Some("proxy-01:8080"));

    // The mirror catches up shortly after.
    let store = MirrorStore::open(&mirror_target).unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(addr) = store.proxy_address("proxy-01").unwrap() {
            assert_eq!(addr, "proxy-01:8080");
            break;
        }
        assert!(Instant::now() < deadline, "mirror never saw proxy-01");
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    let _ = shutdown_tx.send(());
    raft.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn three_node_replication() {
    let base = port_base(3);
    let peers: BTreeMap<u64, String> = (1..=3)
        .map(|i| (i, format!("127.0.0.1:{}", base + i as u16)))
        .collect();

    let mut nodes = Vec::new();
    let mut fsms = Vec::new();
    let mut dirs = Vec::new();
    let (shutdown_tx, _) = broadcast::channel(1);

    for i in 1..=3u64 {
        let dir = TempDir::new().unwrap();
        let config = test_config(i, base + i as u16, peers.clone(), &dir);
        let fsm = Arc::new(AdminFsm::new(None));
        let node = RaftNode::start(&config, fsm.clone(), &shutdown_tx)
            .await
            .unwrap();
        node.bootstrap().await;
        nodes.push(node);
        fsms.push(fsm);
        dirs.push(dir);
    }

    // Some node becomes leader; find it.
    let deadline = Instant::now() + Duration::from_secs(10);
    let leader = loop {
        if let Some(leader) = nodes.iter().find(|n| n.is_leader()) {
            break leader;
        }
        assert!(Instant::now() < deadline, "no leader elected");
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    let outcome = leader
        .propose(register_proxy_cmd("proxy-cluster"))
        .await
        .unwrap();
    assert!(outcome.ok, "{}", outcome.message);

    // Every node's FSM converges on the new proxy.
    let deadline = Instant::now() + Duration::from_secs(5);
    for (i, fsm) in fsms.iter().enumerate() {
        loop {
            let present = fsm.read(|s| s.proxies.contains_key("proxy-cluster"));
            if present {
                break;
            }
            assert!(
                Instant::now() < deadline,
                "node {} never replicated proxy-cluster",
                i + 1
            );
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    let _ = shutdown_tx.send(());
    for node in &nodes {
        node.shutdown().await;
    }
}
