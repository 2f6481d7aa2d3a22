// Unit tests for configuration loading and validation.

use citrine::config::{
    Config, FlagOverrides, LauncherConfig, MirrorTarget, parse_db_urn, parse_peers, rewrite_port,
    validate_host_port,
};
use std::fs;
use tempfile::TempDir;

fn write_config(body: &str) -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    fs::write(&path, body).unwrap();
    let path = path.to_string_lossy().to_string();
    (dir, path)
}

#[test]
fn peers_parse_in_both_forms() {
    let keyed = parse_peers("1=host-a:9000, 2=host-b:9000,3=host-c:9000").unwrap();
    assert_eq!(keyed.len(), 3);
    assert_eq!(keyed.get(&2).map(String::as_str), Some("host-b:9000"));

    let positional = parse_peers("host-a:9000,host-b:9000").unwrap();
    assert_eq!(positional.get(&1).map(String::as_str), Some("host-a:9000"));
    assert_eq!(positional.get(&2).map(String::as_str), Some("host-b:9000"));

    assert!(parse_peers("").unwrap().is_empty());
    assert!(parse_peers("1=a:1,1=b:2").is_err(), "duplicate ids rejected");
}

#[test]
fn empty_peers_become_single_node_mode() {
    let (_dir, path) = write_config("node_id = 7\nhost = \"127.0.0.1\"\nraft_port = 9100\n");
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.peers.len(), 1);
    assert_eq!(
        config.peers.get(&7).map(String::as_str),
        Some("127.0.0.1:9100")
    );
}

#[test]
fn even_peer_counts_are_rejected() {
    let (_dir, path) = write_config(
        "node_id = 1\npeers = \"1=a:9000,2=b:9000\"\n",
    );
    let err = Config::from_file(&path).unwrap_err();
    assert!(err.to_string().contains("odd"), "got: {err:#}");
}

#[test]
fn node_must_appear_in_the_peer_map() {
    let (_dir, path) = write_config(
        "node_id = 9\npeers = \"1=a:9000,2=b:9000,3=c:9000\"\n",
    );
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn lease_must_not_exceed_heartbeat() {
    let (_dir, path) = write_config(
        "node_id = 1\n[raft]\nheartbeat_ms = 500\nleader_lease_ms = 800\n",
    );
    assert!(Config::from_file(&path).is_err());
}

#[test]
fn control_plane_addr_derives_from_the_port_offset() {
    let (_dir, path) = write_config(
        "node_id = 1\nhost = \"10.0.0.5\"\nraft_port = 9000\nrpc_port_offset = 1000\n",
    );
    let config = Config::from_file(&path).unwrap();
    assert_eq!(config.control_plane_addr, "10.0.0.5:10000");
    assert_eq!(config.admin_addr, config.control_plane_addr);
}

#[test]
fn flag_overrides_take_precedence() {
    let (_dir, path) = write_config("node_id = 1\nraft_port = 9000\n");
    let config = Config::from_file_with(
        &path,
        FlagOverrides {
            node_id: Some(3),
            raft_port: Some(9300),
        },
    )
    .unwrap();
    assert_eq!(config.node_id, 3);
    assert_eq!(config.raft_port, 9300);
    // Derived values follow the overridden port.
    assert!(config.advertise_addr.ends_with(":9300"));
    assert!(config.peers.contains_key(&3));
}

#[test]
fn host_port_validation_catches_malformed_addresses() {
    assert!(validate_host_port("host:9000").is_ok());
    assert!(validate_host_port("host").is_err());
    assert!(validate_host_port(":9000").is_err());
    assert!(validate_host_port("host:0").is_err());
    assert!(validate_host_port("host:notaport").is_err());
}

#[test]
fn rewrite_port_applies_the_offset() {
    assert_eq!(rewrite_port("host:9000", 1000).unwrap(), "host:10000");
    assert!(rewrite_port("host:65535", 10).is_err());
    assert!(rewrite_port("nohost", 10).is_err());
}

#[test]
fn db_urn_forms_are_parsed() {
    assert_eq!(
        parse_db_urn("sqlite:///var/lib/citrine/mirror.db").unwrap(),
        MirrorTarget::File("/var/lib/citrine/mirror.db".to_string())
    );
    assert_eq!(
        parse_db_urn("relative/mirror.db").unwrap(),
        MirrorTarget::File("relative/mirror.db".to_string())
    );
    assert_eq!(parse_db_urn("sqlite::memory:").unwrap(), MirrorTarget::Memory);
    assert!(parse_db_urn("postgres://x/y").is_err());
    assert!(parse_db_urn("").is_err());
}

#[test]
fn launcher_config_parses_with_defaults() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("launcher.toml");
    fs::write(
        &path,
        "launcher_id = \"launcher-01\"\ncontrol_plane_endpoints = [\"127.0.0.1:10000\"]\nheartbeat_interval = \"5s\"\n",
    )
    .unwrap();
    let config = LauncherConfig::from_file(&path.to_string_lossy()).unwrap();
    assert_eq!(config.launcher_id, "launcher-01");
    assert_eq!(config.heartbeat_interval, std::time::Duration::from_secs(5));
    assert_eq!(config.base_grpc_port, 50051);
    assert_eq!(config.default_grace_period, std::time::Duration::from_secs(10));
}

#[test]
fn launcher_config_requires_endpoints() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("launcher.toml");
    fs::write(&path, "launcher_id = \"x\"\ncontrol_plane_endpoints = []\n").unwrap();
    assert!(LauncherConfig::from_file(&path.to_string_lossy()).is_err());
}
