// src/core/metrics.rs

//! Defines and registers Prometheus metrics for every layer of the control
//! plane and the launcher agent.
//!
//! This module uses `lazy_static` to ensure that metrics are registered only
//! once globally for the entire application lifecycle.

use lazy_static::lazy_static;
use prometheus::{
    Counter, CounterVec, Gauge, GaugeVec, Histogram, HistogramVec, TextEncoder, register_counter,
    register_counter_vec, register_gauge, register_gauge_vec, register_histogram,
    register_histogram_vec,
};

lazy_static! {
    // --- Raft / consensus ---
    /// A boolean gauge indicating whether this node is the current Raft leader.
    pub static ref RAFT_IS_LEADER: Gauge =
        register_gauge!("citrine_raft_is_leader", "Whether this node is the Raft leader (1 for true, 0 for false).").unwrap();
    /// The current Raft term as observed by this node.
    pub static ref RAFT_TERM: Gauge =
        register_gauge!("citrine_raft_term", "Current Raft term.").unwrap();
    /// The last log index written to this node's Raft log.
    pub static ref RAFT_LAST_LOG_INDEX: Gauge =
        register_gauge!("citrine_raft_last_log_index", "Last Raft log index.").unwrap();
    /// The total number of observed leader identity changes.
    pub static ref LEADER_CHANGES_TOTAL: Counter =
        register_counter!("citrine_leader_changes_total", "Total number of observed Raft leader changes.").unwrap();
    /// The total number of commands proposed to Raft by this node.
    pub static ref PROPOSALS_TOTAL: Counter =
        register_counter!("citrine_proposals_total", "Total number of Raft proposals issued.").unwrap();
    /// Failed proposals, labeled by failure kind (timeout, not_leader, other).
    pub static ref PROPOSE_FAILURES_TOTAL: CounterVec =
        register_counter_vec!("citrine_propose_failures_total", "Total number of failed Raft proposals, labeled by kind.", &["kind"]).unwrap();
    /// A histogram of Raft propose latencies.
    pub static ref PROPOSE_LATENCY_SECONDS: Histogram =
        register_histogram!("citrine_propose_latency_seconds", "Latency of Raft proposals in seconds.").unwrap();
    /// The total number of snapshots built by this node.
    pub static ref SNAPSHOTS_TOTAL: Counter =
        register_counter!("citrine_snapshots_total", "Total number of FSM snapshots built.").unwrap();

    // --- Admin state machine ---
    /// Applied commands, labeled by command type.
    pub static ref FSM_APPLIES_TOTAL: CounterVec =
        register_counter_vec!("citrine_fsm_applies_total", "Total number of commands applied to the admin FSM, labeled by type.", &["type"]).unwrap();
    /// Applies that committed but returned an error marker (e.g. a status
    /// update for an unregistered entity).
    pub static ref FSM_APPLY_ERRORS_TOTAL: CounterVec =
        register_counter_vec!("citrine_fsm_apply_errors_total", "Total number of committed applies that returned an error marker, labeled by type.", &["type"]).unwrap();
    /// A histogram of FSM apply latencies.
    pub static ref FSM_APPLY_LATENCY_SECONDS: Histogram =
        register_histogram!("citrine_fsm_apply_latency_seconds", "Latency of admin FSM applies in seconds.").unwrap();
    /// The total number of failed mirror-store writes.
    pub static ref MIRROR_WRITE_FAILURES_TOTAL: Counter =
        register_counter!("citrine_mirror_write_failures_total", "Total number of failed mirror store writes.").unwrap();

    // --- Control plane RPC surface ---
    /// RPC requests served, labeled by operation.
    pub static ref RPC_REQUESTS_TOTAL: CounterVec =
        register_counter_vec!("citrine_rpc_requests_total", "Total number of control plane RPC requests, labeled by operation.", &["op"]).unwrap();
    /// Writes forwarded from this follower to the leader.
    pub static ref RPC_FORWARDED_TOTAL: Counter =
        register_counter!("citrine_rpc_forwarded_total", "Total number of RPCs forwarded to the leader.").unwrap();
    /// RPCs answered UNAVAILABLE because no leader was reachable.
    pub static ref RPC_UNAVAILABLE_TOTAL: Counter =
        register_counter!("citrine_rpc_unavailable_total", "Total number of RPCs answered UNAVAILABLE.").unwrap();
    /// Reads served, labeled by consistency tier.
    pub static ref READS_TOTAL: CounterVec =
        register_counter_vec!("citrine_reads_total", "Total number of reads served, labeled by consistency tier.", &["consistency"]).unwrap();
    /// Heartbeats processed, labeled by origin (proxy, launcher).
    pub static ref HEARTBEATS_TOTAL: CounterVec =
        register_counter_vec!("citrine_heartbeats_total", "Total number of heartbeats processed, labeled by origin.", &["origin"]).unwrap();
    /// The number of clients currently connected to the RPC surface.
    pub static ref CONNECTED_CLIENTS: Gauge =
        register_gauge!("citrine_connected_clients", "Number of currently connected RPC clients.").unwrap();

    // --- Process lifecycle manager ---
    /// The number of items currently queued in the work queue.
    pub static ref WORK_QUEUE_DEPTH: Gauge =
        register_gauge!("citrine_work_queue_depth", "Current depth of the process work queue.").unwrap();
    /// Managed processes, labeled by lifecycle state.
    pub static ref PROCESSES: GaugeVec =
        register_gauge_vec!("citrine_processes", "Number of managed processes, labeled by state.", &["state"]).unwrap();
    /// The total number of pattern process restarts.
    pub static ref PROCESS_RESTARTS_TOTAL: Counter =
        register_counter!("citrine_process_restarts_total", "Total number of pattern process restarts.").unwrap();
    /// Sync latencies, labeled by sync phase.
    pub static ref SYNC_LATENCY_SECONDS: HistogramVec =
        register_histogram_vec!("citrine_sync_latency_seconds", "Latency of process sync operations in seconds, labeled by phase.", &["phase"]).unwrap();
    /// The total number of circuit-breaker trips (processes marked terminal).
    pub static ref CIRCUIT_BREAKER_TRIPS_TOTAL: Counter =
        register_counter!("citrine_circuit_breaker_trips_total", "Total number of processes marked terminal by the circuit breaker.").unwrap();
    /// The total number of orphan processes reaped.
    pub static ref ORPHANS_REAPED_TOTAL: Counter =
        register_counter!("citrine_orphans_reaped_total", "Total number of orphan pattern processes reaped.").unwrap();
    /// The total number of liveness check failures seen by the health monitor.
    pub static ref HEALTH_CHECK_FAILURES_TOTAL: Counter =
        register_counter!("citrine_health_check_failures_total", "Total number of failed periodic liveness checks.").unwrap();
    /// Lifecycle events reported by the agent, labeled by kind.
    pub static ref LIFECYCLE_EVENTS_TOTAL: CounterVec =
        register_counter_vec!("citrine_lifecycle_events_total", "Total number of lifecycle events reported, labeled by kind.", &["kind"]).unwrap();
}

/// Gathers all registered metrics and encodes them in the Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families).unwrap()
}
