// src/core/admin/partition.rs

//! Pure partition math: maps namespaces onto the 256-partition keyspace and
//! computes per-proxy partition ranges from the sorted proxy set.
//!
//! Ranges are computed on demand and never stored, so they shift implicitly
//! as proxies register and deregister. Already-assigned namespaces keep their
//! persisted `assigned_proxy` until explicitly rewritten.

use crate::core::admin::state::{AdminState, ProxyInfo};
use crate::core::errors::CitrineError;
use crc::{CRC_32_ISO_HDLC, Crc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The fixed number of partitions in the keyspace.
pub const NUM_PARTITIONS: i32 = 256;

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A contiguous, inclusive band of partition ids owned by one proxy.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, bincode::Encode, bincode::Decode,
)]
pub struct PartitionRange {
    pub start: i32,
    pub end: i32,
}

impl PartitionRange {
    pub fn contains(&self, partition: i32) -> bool {
        partition >= self.start && partition <= self.end
    }
}

/// Maps a namespace name to its partition id via a stable CRC32 checksum.
/// The same name always hashes to the same partition, across processes and
/// restarts.
pub fn hash_namespace(name: &str) -> i32 {
    (CRC32.checksum(name.as_bytes()) % NUM_PARTITIONS as u32) as i32
}

/// Returns the partition range owned by `target`, or `None` when the proxy is
/// unknown or the proxy set is empty.
///
/// Each of the N proxies (sorted ascending by id) owns a band of
/// `floor(256 / N)` partitions; the last proxy absorbs the remainder up
/// to 255.
pub fn compute_ranges(
    target: &str,
    proxies: &BTreeMap<String, ProxyInfo>,
) -> Option<PartitionRange> {
    let n = proxies.len() as i32;
    if n == 0 {
        return None;
    }
    let index = proxies.keys().position(|id| id == target)? as i32;
    let range_size = (NUM_PARTITIONS / n).max(1);
    let start = index * range_size;
    let end = if index == n - 1 {
        NUM_PARTITIONS - 1
    } else {
        start + range_size - 1
    };
    Some(PartitionRange { start, end })
}

/// Computes the full range table for every proxy in the set. An empty proxy
/// set yields an empty table.
pub fn compute_all_ranges(proxies: &BTreeMap<String, ProxyInfo>) -> Vec<(String, PartitionRange)> {
    proxies
        .keys()
        .filter_map(|id| compute_ranges(id, proxies).map(|r| (id.clone(), r)))
        .collect()
}

/// The inverse of `compute_ranges`: which proxy serves partition `partition`.
/// Returns `Ok(None)` for an empty proxy set and rejects out-of-range
/// partition ids.
pub fn get_proxy_for_partition(
    partition: i32,
    proxies: &BTreeMap<String, ProxyInfo>,
) -> Result<Option<String>, CitrineError> {
    if !(0..NUM_PARTITIONS).contains(&partition) {
        return Err(CitrineError::InvalidArgument(format!(
            "partition id {partition} is outside [0, {}]",
            NUM_PARTITIONS - 1
        )));
    }
    let n = proxies.len() as i32;
    if n == 0 {
        return Ok(None);
    }
    let range_size = (NUM_PARTITIONS / n).max(1);
    let index = (partition / range_size).min(n - 1) as usize;
    Ok(proxies.keys().nth(index).cloned())
}

/// Asserts that the computed ranges cover `[0, 255]` exactly once, with no
/// gaps and no overlaps.
pub fn validate_coverage(proxies: &BTreeMap<String, ProxyInfo>) -> Result<(), CitrineError> {
    let ranges = compute_all_ranges(proxies);
    if ranges.is_empty() {
        return Err(CitrineError::Internal(
            "partition coverage is undefined for an empty proxy set".to_string(),
        ));
    }
    let mut expected_start = 0;
    for (proxy_id, range) in &ranges {
        if range.start != expected_start {
            return Err(CitrineError::Internal(format!(
                "partition coverage violation at proxy '{proxy_id}': range starts at {} but {} was expected",
                range.start, expected_start
            )));
        }
        if range.end < range.start {
            return Err(CitrineError::Internal(format!(
                "partition coverage violation at proxy '{proxy_id}': empty range {}..{}",
                range.start, range.end
            )));
        }
        expected_start = range.end + 1;
    }
    if expected_start != NUM_PARTITIONS {
        return Err(CitrineError::Internal(format!(
            "partition coverage violation: ranges end at {} instead of {}",
            expected_start - 1,
            NUM_PARTITIONS - 1
        )));
    }
    Ok(())
}

/// A namespace whose persisted placement no longer matches the placement the
/// current proxy set would compute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyMove {
    pub namespace: String,
    pub from_proxy: String,
    pub to_proxy: String,
}

/// Advisory helper: namespaces that would move to a different proxy now that
/// a proxy has joined. Nothing in the apply path calls this; placements stay
/// as persisted until explicitly rewritten.
pub fn rebalance_on_proxy_join(state: &AdminState) -> Vec<ProxyMove> {
    stale_placements(state)
}

/// Advisory helper: namespaces stranded on a proxy that has left the range
/// table. Same contract as `rebalance_on_proxy_join`.
pub fn rebalance_on_proxy_leave(state: &AdminState) -> Vec<ProxyMove> {
    stale_placements(state)
}

fn stale_placements(state: &AdminState) -> Vec<ProxyMove> {
    let mut moves = Vec::new();
    for ns in state.namespaces.values() {
        let computed = match get_proxy_for_partition(ns.partition_id, &state.proxies) {
            Ok(Some(proxy)) => proxy,
            _ => continue,
        };
        if computed != ns.assigned_proxy {
            moves.push(ProxyMove {
                namespace: ns.name.clone(),
                from_proxy: ns.assigned_proxy.clone(),
                to_proxy: computed,
            });
        }
    }
    moves
}
