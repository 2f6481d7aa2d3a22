// src/config.rs

//! Manages node and launcher configuration: loading, environment overrides,
//! and validation.

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

/// The read-consistency tiers offered by the control plane, in order of
/// increasing guarantee and latency cost.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ReadConsistency {
    #[default]
    Stale,
    LeaseCheck,
    Linearizable,
}

impl ReadConsistency {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReadConsistency::Stale => "stale",
            ReadConsistency::LeaseCheck => "lease-check",
            ReadConsistency::Linearizable => "linearizable",
        }
    }
}

/// Per-operation read-consistency defaults.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct ReadConsistencyConfig {
    #[serde(default)]
    pub get_namespace: ReadConsistency,
    #[serde(default)]
    pub list_namespaces: ReadConsistency,
    #[serde(default)]
    pub get_proxy: ReadConsistency,
    #[serde(default)]
    pub list_proxies: ReadConsistency,
    #[serde(default)]
    pub list_launchers: ReadConsistency,
    #[serde(default)]
    pub list_patterns: ReadConsistency,
}

/// Raft timing knobs. The defaults follow the shipped cluster profile:
/// heartbeat 1000ms, election 3000ms, leader lease 500ms, commit 50ms.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RaftTimingConfig {
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_election_ms")]
    pub election_ms: u64,
    #[serde(default = "default_leader_lease_ms")]
    pub leader_lease_ms: u64,
    #[serde(default = "default_commit_ms")]
    pub commit_ms: u64,
}

impl Default for RaftTimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_ms: default_heartbeat_ms(),
            election_ms: default_election_ms(),
            leader_lease_ms: default_leader_lease_ms(),
            commit_ms: default_commit_ms(),
        }
    }
}

fn default_heartbeat_ms() -> u64 {
    1000
}
fn default_election_ms() -> u64 {
    3000
}
fn default_leader_lease_ms() -> u64 {
    500
}
fn default_commit_ms() -> u64 {
    50
}

/// Configuration for the Prometheus metrics exporter.
#[derive(Serialize, Deserialize, Debug, Clone, Default)]
pub struct MetricsConfig {
    /// If true, an HTTP server will be started to expose Prometheus metrics.
    #[serde(default)]
    pub enabled: bool,
    /// The port for the Prometheus metrics server.
    #[serde(default = "default_metrics_port")]
    pub port: u16,
}

fn default_metrics_port() -> u16 {
    8878
}

/// The raw on-disk shape of a control-plane node configuration file.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct RawConfig {
    #[serde(default = "default_node_id")]
    node_id: u64,
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_raft_port")]
    raft_port: u16,
    /// `host:port` of this node's raft bus as seen by its peers. Defaults to
    /// `host:raft_port`.
    #[serde(default)]
    advertise_addr: Option<String>,
    /// Static peer set, `id=host:port` pairs separated by commas. Empty means
    /// single-node mode with this node as the sole peer.
    #[serde(default)]
    peers: String,
    #[serde(default = "default_data_dir")]
    data_dir: String,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default = "default_snapshot_threshold")]
    snapshot_threshold: u64,
    #[serde(default)]
    raft: RaftTimingConfig,
    /// Fixed offset between a node's raft bus port and its control-plane RPC
    /// port. Leader addresses handed to clients are rewritten with it.
    #[serde(default = "default_rpc_port_offset")]
    rpc_port_offset: u16,
    /// Control-plane RPC listen address. Defaults to `host:(raft_port + rpc_port_offset)`.
    #[serde(default)]
    control_plane_addr: Option<String>,
    /// Admin API listen address. Defaults to the control-plane address (one
    /// surface serves both).
    #[serde(default)]
    admin_addr: Option<String>,
    #[serde(default = "default_db_urn")]
    db_urn: String,
    #[serde(with = "humantime_serde", default = "default_max_staleness")]
    max_staleness: Duration,
    #[serde(default)]
    read_consistency: ReadConsistencyConfig,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_node_id() -> u64 {
    1
}
fn default_host() -> String {
    "127.0.0.1".to_string()
}
fn default_raft_port() -> u16 {
    9000
}
fn default_data_dir() -> String {
    "citrine_data".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_snapshot_threshold() -> u64 {
    10_000
}
fn default_rpc_port_offset() -> u16 {
    1000
}
fn default_db_urn() -> String {
    "sqlite://citrine_data/mirror.db".to_string()
}
fn default_max_staleness() -> Duration {
    Duration::from_millis(200)
}

/// The resolved control-plane node configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub node_id: u64,
    pub host: String,
    pub raft_port: u16,
    pub advertise_addr: String,
    pub peers: BTreeMap<u64, String>,
    pub data_dir: String,
    pub log_level: String,
    pub snapshot_threshold: u64,
    pub raft: RaftTimingConfig,
    pub rpc_port_offset: u16,
    pub control_plane_addr: String,
    pub admin_addr: String,
    pub db_urn: String,
    pub max_staleness: Duration,
    pub read_consistency: ReadConsistencyConfig,
    pub metrics: MetricsConfig,
}

/// Command-line overrides, applied with the highest precedence during
/// resolution so derived addresses and validation see the final values.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlagOverrides {
    pub node_id: Option<u64>,
    pub raft_port: Option<u16>,
}

impl Config {
    /// Creates a new `Config` by reading a TOML file, applying `CITRINE_*`
    /// environment overrides, resolving derived addresses, and validating.
    pub fn from_file(path: &str) -> Result<Self> {
        Self::from_file_with(path, FlagOverrides::default())
    }

    /// `from_file` with command-line overrides layered on top
    /// (flags > env > file > defaults).
    pub fn from_file_with(path: &str, flags: FlagOverrides) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at '{path}'"))?;
        let raw: RawConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;
        Self::resolve(raw, flags)
    }

    /// Builds a configuration entirely from defaults, for single-node dev use.
    pub fn default_single_node() -> Result<Self> {
        Self::default_single_node_with(FlagOverrides::default())
    }

    pub fn default_single_node_with(flags: FlagOverrides) -> Result<Self> {
        let raw: RawConfig = toml::from_str("").context("defaults failed to parse")?;
        Self::resolve(raw, flags)
    }

    fn resolve(mut raw: RawConfig, flags: FlagOverrides) -> Result<Self> {
        apply_env_overrides(&mut raw)?;
        if let Some(node_id) = flags.node_id {
            raw.node_id = node_id;
        }
        if let Some(raft_port) = flags.raft_port {
            raw.raft_port = raft_port;
        }

        let advertise_addr = raw
            .advertise_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", raw.host, raw.raft_port));

        let mut peers = parse_peers(&raw.peers)?;
        if peers.is_empty() {
            // Single-node mode: this node is the sole peer.
            peers.insert(raw.node_id, advertise_addr.clone());
        }

        let rpc_port = raw
            .raft_port
            .checked_add(raw.rpc_port_offset)
            .ok_or_else(|| anyhow!("raft_port + rpc_port_offset exceeds the valid port range"))?;
        let control_plane_addr = raw
            .control_plane_addr
            .clone()
            .unwrap_or_else(|| format!("{}:{}", raw.host, rpc_port));
        let admin_addr = raw.admin_addr.clone().unwrap_or_else(|| control_plane_addr.clone());

        let config = Config {
            node_id: raw.node_id,
            host: raw.host,
            raft_port: raw.raft_port,
            advertise_addr,
            peers,
            data_dir: raw.data_dir,
            log_level: raw.log_level,
            snapshot_threshold: raw.snapshot_threshold,
            raft: raw.raft,
            rpc_port_offset: raw.rpc_port_offset,
            control_plane_addr,
            admin_addr,
            db_urn: raw.db_urn,
            max_staleness: raw.max_staleness,
            read_consistency: raw.read_consistency,
            metrics: raw.metrics,
        };

        config.validate()?;
        Ok(config)
    }

    /// Validates the resolved configuration to ensure logical consistency.
    pub fn validate(&self) -> Result<()> {
        if self.raft_port == 0 {
            return Err(anyhow!("raft_port cannot be 0"));
        }
        if self.host.trim().is_empty() {
            return Err(anyhow!("host cannot be empty"));
        }
        validate_host_port(&self.advertise_addr)
            .with_context(|| format!("invalid advertise_addr '{}'", self.advertise_addr))?;

        if self.peers.len() > 1 && self.peers.len() % 2 == 0 {
            return Err(anyhow!(
                "peer count must be odd for quorum safety, got {}",
                self.peers.len()
            ));
        }
        if !self.peers.contains_key(&self.node_id) {
            return Err(anyhow!(
                "this node's id ({}) does not appear in the peers map",
                self.node_id
            ));
        }
        for (id, addr) in &self.peers {
            validate_host_port(addr)
                .with_context(|| format!("invalid peer address '{addr}' for node {id}"))?;
        }

        if self.raft.leader_lease_ms > self.raft.heartbeat_ms {
            return Err(anyhow!(
                "leader_lease_ms ({}) must not exceed heartbeat_ms ({})",
                self.raft.leader_lease_ms,
                self.raft.heartbeat_ms
            ));
        }
        if self.raft.election_ms <= self.raft.heartbeat_ms {
            return Err(anyhow!(
                "election_ms ({}) must exceed heartbeat_ms ({})",
                self.raft.election_ms,
                self.raft.heartbeat_ms
            ));
        }

        parse_db_urn(&self.db_urn)?;

        if self.metrics.enabled && self.metrics.port == 0 {
            return Err(anyhow!("metrics.port cannot be 0"));
        }
        Ok(())
    }

    /// Returns the control-plane RPC address of a peer, derived from its raft
    /// bus address and the fixed port offset.
    pub fn rpc_addr_of(&self, bus_addr: &str) -> Result<String> {
        rewrite_port(bus_addr, self.rpc_port_offset)
    }
}

/// Parses `id=host:port,id=host:port,...` (or positional `host:port,...`,
/// ids assigned from 1) into a peer map.
pub fn parse_peers(spec: &str) -> Result<BTreeMap<u64, String>> {
    let mut peers = BTreeMap::new();
    for (pos, part) in spec
        .split(',')
        .map(str::trim)
        .filter(|p| !p.is_empty())
        .enumerate()
    {
        let (id, addr) = match part.split_once('=') {
            Some((id_str, addr)) => {
                let id: u64 = id_str
                    .trim()
                    .parse()
                    .with_context(|| format!("invalid peer id in '{part}'"))?;
                (id, addr.trim().to_string())
            }
            None => ((pos as u64) + 1, part.to_string()),
        };
        if peers.insert(id, addr).is_some() {
            return Err(anyhow!("duplicate peer id {id}"));
        }
    }
    Ok(peers)
}

/// Checks that an address is of the form `host:port` with a non-zero port.
pub fn validate_host_port(addr: &str) -> Result<()> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port"))?;
    if host.trim().is_empty() {
        return Err(anyhow!("host part is empty"));
    }
    let port: u16 = port.parse().context("invalid port")?;
    if port == 0 {
        return Err(anyhow!("port cannot be 0"));
    }
    Ok(())
}

/// Rewrites the port of a `host:port` address by a fixed offset. Used to map
/// a peer's raft bus address to its control-plane RPC address.
pub fn rewrite_port(addr: &str, offset: u16) -> Result<String> {
    let (host, port) = addr
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("expected host:port, got '{addr}'"))?;
    let port: u16 = port.parse().with_context(|| format!("invalid port in '{addr}'"))?;
    let rewritten = port
        .checked_add(offset)
        .ok_or_else(|| anyhow!("port {port} + offset {offset} exceeds the valid range"))?;
    Ok(format!("{host}:{rewritten}"))
}

/// Parses a mirror-store URN of the form `sqlite://<path>` or
/// `sqlite::memory:`. A bare path is accepted for convenience.
pub fn parse_db_urn(urn: &str) -> Result<MirrorTarget> {
    if urn == "sqlite::memory:" || urn == ":memory:" {
        return Ok(MirrorTarget::Memory);
    }
    if let Some(path) = urn.strip_prefix("sqlite://") {
        if path.trim().is_empty() {
            return Err(anyhow!("empty path in db_urn '{urn}'"));
        }
        return Ok(MirrorTarget::File(path.to_string()));
    }
    if urn.contains("://") {
        return Err(anyhow!(
            "unsupported db_urn scheme in '{urn}': only sqlite:// is supported"
        ));
    }
    if urn.trim().is_empty() {
        return Err(anyhow!("db_urn cannot be empty"));
    }
    Ok(MirrorTarget::File(urn.to_string()))
}

/// The resolved target of the local durable mirror store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MirrorTarget {
    File(String),
    Memory,
}

fn apply_env_overrides(raw: &mut RawConfig) -> Result<()> {
    if let Ok(v) = std::env::var("CITRINE_NODE_ID") {
        raw.node_id = v.parse().context("invalid CITRINE_NODE_ID")?;
    }
    if let Ok(v) = std::env::var("CITRINE_HOST") {
        raw.host = v;
    }
    if let Ok(v) = std::env::var("CITRINE_RAFT_PORT") {
        raw.raft_port = v.parse().context("invalid CITRINE_RAFT_PORT")?;
    }
    if let Ok(v) = std::env::var("CITRINE_ADVERTISE_ADDR") {
        raw.advertise_addr = Some(v);
    }
    if let Ok(v) = std::env::var("CITRINE_PEERS") {
        raw.peers = v;
    }
    if let Ok(v) = std::env::var("CITRINE_DATA_DIR") {
        raw.data_dir = v;
    }
    if let Ok(v) = std::env::var("CITRINE_DB_URN") {
        raw.db_urn = v;
    }
    if let Ok(v) = std::env::var("CITRINE_CONTROL_PLANE_ADDR") {
        raw.control_plane_addr = Some(v);
    }
    if let Ok(v) = std::env::var("CITRINE_LOG_LEVEL") {
        raw.log_level = v;
    }
    Ok(())
}

// --- Launcher agent configuration ---

/// The raw on-disk shape of a launcher agent configuration file.
#[derive(Serialize, Deserialize, Debug, Clone)]
struct RawLauncherConfig {
    launcher_id: Option<String>,
    #[serde(default = "default_agent_address")]
    address: String,
    #[serde(default = "default_region")]
    region: String,
    /// Control-plane RPC endpoints to register with, tried in order.
    control_plane_endpoints: Vec<String>,
    #[serde(default = "default_manifest_dir")]
    manifest_dir: String,
    #[serde(default = "default_max_processes")]
    max_processes: i32,
    #[serde(with = "humantime_serde", default = "default_heartbeat_interval")]
    heartbeat_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_resync_interval")]
    resync_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_back_off_period")]
    back_off_period: Duration,
    #[serde(with = "humantime_serde", default = "default_grace_period")]
    default_grace_period: Duration,
    #[serde(with = "humantime_serde", default = "default_orphan_reap_interval")]
    orphan_reap_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_health_monitor_interval")]
    health_monitor_interval: Duration,
    #[serde(with = "humantime_serde", default = "default_shutdown_timeout")]
    shutdown_timeout: Duration,
    #[serde(default = "default_base_grpc_port")]
    base_grpc_port: u16,
    #[serde(default = "default_log_level")]
    log_level: String,
    #[serde(default)]
    metrics: MetricsConfig,
}

fn default_agent_address() -> String {
    "127.0.0.1:0".to_string()
}
fn default_region() -> String {
    "local".to_string()
}
fn default_manifest_dir() -> String {
    "patterns".to_string()
}
fn default_max_processes() -> i32 {
    32
}
fn default_heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}
fn default_resync_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_back_off_period() -> Duration {
    Duration::from_secs(300)
}
fn default_grace_period() -> Duration {
    Duration::from_secs(10)
}
fn default_orphan_reap_interval() -> Duration {
    Duration::from_secs(60)
}
fn default_health_monitor_interval() -> Duration {
    Duration::from_secs(30)
}
fn default_shutdown_timeout() -> Duration {
    Duration::from_secs(30)
}
fn default_base_grpc_port() -> u16 {
    50051
}

/// The resolved launcher agent configuration.
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    pub launcher_id: String,
    pub address: String,
    pub region: String,
    pub control_plane_endpoints: Vec<String>,
    pub manifest_dir: String,
    pub max_processes: i32,
    pub heartbeat_interval: Duration,
    pub resync_interval: Duration,
    pub back_off_period: Duration,
    pub default_grace_period: Duration,
    pub orphan_reap_interval: Duration,
    pub health_monitor_interval: Duration,
    pub shutdown_timeout: Duration,
    pub base_grpc_port: u16,
    pub log_level: String,
    pub metrics: MetricsConfig,
}

impl LauncherConfig {
    /// Creates a new `LauncherConfig` by reading and parsing a TOML file.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read launcher config at '{path}'"))?;
        let raw: RawLauncherConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse TOML from '{path}'"))?;

        let launcher_id = raw
            .launcher_id
            .clone()
            .unwrap_or_else(|| format!("launcher-{}", uuid::Uuid::new_v4()));

        let config = LauncherConfig {
            launcher_id,
            address: raw.address,
            region: raw.region,
            control_plane_endpoints: raw.control_plane_endpoints,
            manifest_dir: raw.manifest_dir,
            max_processes: raw.max_processes,
            heartbeat_interval: raw.heartbeat_interval,
            resync_interval: raw.resync_interval,
            back_off_period: raw.back_off_period,
            default_grace_period: raw.default_grace_period,
            orphan_reap_interval: raw.orphan_reap_interval,
            health_monitor_interval: raw.health_monitor_interval,
            shutdown_timeout: raw.shutdown_timeout,
            base_grpc_port: raw.base_grpc_port,
            log_level: raw.log_level,
            metrics: raw.metrics,
        };
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.control_plane_endpoints.is_empty() {
            return Err(anyhow!("control_plane_endpoints cannot be empty"));
        }
        for addr in &self.control_plane_endpoints {
            validate_host_port(addr)
                .with_context(|| format!("invalid control plane endpoint '{addr}'"))?;
        }
        if self.max_processes <= 0 {
            return Err(anyhow!("max_processes must be positive"));
        }
        if self.base_grpc_port == 0 {
            return Err(anyhow!("base_grpc_port cannot be 0"));
        }
        Ok(())
    }
}
