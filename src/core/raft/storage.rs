// src/core/raft/storage.rs

//! openraft storage bridged to the `AdminFsm`.
//!
//! The log and membership live in memory; the vote and snapshots are
//! persisted under the raft data directory so a restarted node recovers its
//! state machine from the latest snapshot. Implements the v1 `RaftStorage`
//! API and is wrapped by `openraft::storage::Adaptor` into the split
//! `RaftLogStorage` + `RaftStateMachine` interface required by `Raft::new`.

use super::{NodeId, TypeConfig};
use crate::core::admin::AdminFsm;
use crate::core::admin::state::AdminSnapshot;
use crate::core::commands::ApplyOutcome;
use crate::core::errors::CitrineError;
use crate::core::metrics;
use openraft::storage::{RaftLogReader, RaftSnapshotBuilder, RaftStorage};
use openraft::{
    AnyError, BasicNode, Entry, ErrorSubject, ErrorVerb, LogId, LogState, RaftLogId, Snapshot,
    SnapshotMeta, StorageError, StorageIOError, StoredMembership, Vote,
};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::ops::RangeBounds;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

const VOTE_FILE: &str = "vote.json";
const SNAPSHOT_DIR: &str = "snapshots";
const SNAPSHOT_ZSTD_LEVEL: i32 = 3;

fn storage_io_error(verb: ErrorVerb, e: impl std::fmt::Display) -> StorageError<NodeId> {
    StorageIOError::new(ErrorSubject::Store, verb, AnyError::error(e.to_string())).into()
}

/// Serializes a state snapshot to the bytes shipped between nodes:
/// zstd-compressed bincode.
pub fn encode_snapshot(snapshot: &AdminSnapshot) -> Result<Vec<u8>, CitrineError> {
    let raw = bincode::encode_to_vec(snapshot, bincode::config::standard())?;
    zstd::encode_all(raw.as_slice(), SNAPSHOT_ZSTD_LEVEL)
        .map_err(|e| CitrineError::Internal(format!("snapshot compression failed: {e}")))
}

pub fn decode_snapshot(bytes: &[u8]) -> Result<AdminSnapshot, CitrineError> {
    let raw = zstd::decode_all(bytes)
        .map_err(|e| CitrineError::Internal(format!("snapshot decompression failed: {e}")))?;
    let (snapshot, _) =
        bincode::decode_from_slice::<AdminSnapshot, _>(&raw, bincode::config::standard())?;
    Ok(snapshot)
}

/// On-disk sidecar carrying the openraft snapshot metadata next to the data
/// blob.
#[derive(serde::Serialize, serde::Deserialize)]
struct SnapshotManifest {
    meta: SnapshotMeta<NodeId, BasicNode>,
}

/// Combined in-memory log + FSM-backed state machine storage.
pub struct LogStore {
    vote: Option<Vote<NodeId>>,
    log: BTreeMap<u64, Entry<TypeConfig>>,
    committed: Option<LogId<NodeId>>,
    last_purged: Option<LogId<NodeId>>,
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    fsm: Arc<AdminFsm>,
    data_dir: PathBuf,
}

impl LogStore {
    /// Opens the storage, creating the data directory as needed and
    /// recovering the FSM from the newest persisted snapshot.
    pub fn new(data_dir: impl AsRef<Path>, fsm: Arc<AdminFsm>) -> Result<Self, CitrineError> {
        let data_dir = data_dir.as_ref().to_path_buf();
        std::fs::create_dir_all(data_dir.join(SNAPSHOT_DIR))?;

        let vote = read_vote_file(&data_dir)?;
        let mut store = Self {
            vote,
            log: BTreeMap::new(),
            committed: None,
            last_purged: None,
            last_applied: None,
            last_membership: StoredMembership::default(),
            fsm,
            data_dir,
        };

        if let Some((meta, data)) = read_latest_snapshot(&store.data_dir)? {
            let snapshot = decode_snapshot(&data)?;
            info!(
                "Recovered admin state from snapshot at index {}",
                snapshot.last_applied_index
            );
            store.fsm.restore(snapshot);
            store.last_applied = meta.last_log_id;
            store.last_purged = meta.last_log_id;
            store.last_membership = meta.last_membership.clone();
        }
        Ok(store)
    }
}

fn vote_path(data_dir: &Path) -> PathBuf {
    data_dir.join(VOTE_FILE)
}

fn read_vote_file(data_dir: &Path) -> Result<Option<Vote<NodeId>>, CitrineError> {
    let path = vote_path(data_dir);
    if !path.exists() {
        return Ok(None);
    }
    let content = std::fs::read_to_string(&path)?;
    let vote = serde_json::from_str(&content)?;
    Ok(Some(vote))
}

/// Writes a file atomically with the tmp-then-rename pattern.
fn write_atomically(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    let tmp = path.with_extension(format!("tmp-{}", rand::random::<u32>()));
    std::fs::write(&tmp, contents)?;
    std::fs::rename(tmp, path)
}

fn snapshot_data_path(data_dir: &Path, snapshot_id: &str) -> PathBuf {
    data_dir.join(SNAPSHOT_DIR).join(format!("{snapshot_id}.bin"))
}

fn snapshot_meta_path(data_dir: &Path, snapshot_id: &str) -> PathBuf {
    data_dir.join(SNAPSHOT_DIR).join(format!("{snapshot_id}.meta.json"))
}

fn persist_snapshot(
    data_dir: &Path,
    meta: &SnapshotMeta<NodeId, BasicNode>,
    data: &[u8],
) -> Result<(), CitrineError> {
    let manifest = SnapshotManifest { meta: meta.clone() };
    write_atomically(&snapshot_data_path(data_dir, &meta.snapshot_id), data)?;
    write_atomically(
        &snapshot_meta_path(data_dir, &meta.snapshot_id),
        serde_json::to_vec(&manifest)?.as_slice(),
    )?;
    Ok(())
}

/// Returns the newest persisted snapshot (by last log index) if any.
fn read_latest_snapshot(
    data_dir: &Path,
) -> Result<Option<(SnapshotMeta<NodeId, BasicNode>, Vec<u8>)>, CitrineError> {
    let snap_dir = data_dir.join(SNAPSHOT_DIR);
    let mut best: Option<(u64, SnapshotMeta<NodeId, BasicNode>, PathBuf)> = None;
    for entry in std::fs::read_dir(&snap_dir)? {
        let entry = entry?;
        let path = entry.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                warn!("Skipping unreadable snapshot manifest {:?}: {}", path, e);
                continue;
            }
        };
        let manifest: SnapshotManifest = match serde_json::from_str(&content) {
            Ok(m) => m,
            Err(e) => {
                warn!("Skipping corrupt snapshot manifest {:?}: {}", path, e);
                continue;
            }
        };
        let index = manifest.meta.last_log_id.map(|l| l.index).unwrap_or(0);
        if best.as_ref().map(|(i, _, _)| index > *i).unwrap_or(true) {
            let data_path = snapshot_data_path(data_dir, &manifest.meta.snapshot_id);
            best = Some((index, manifest.meta, data_path));
        }
    }
    match best {
        Some((_, meta, data_path)) => {
            let data = std::fs::read(&data_path)?;
            Ok(Some((meta, data)))
        }
        None => Ok(None),
    }
}

// RaftStorage v1 requires LogStore to implement RaftLogReader directly
// (because RaftStorage: RaftLogReader).
impl RaftLogReader<TypeConfig> for LogStore {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Log reader backed by a snapshot of the log at a point in time.
pub struct MemLogReader {
    log: BTreeMap<u64, Entry<TypeConfig>>,
}

impl RaftLogReader<TypeConfig> for MemLogReader {
    async fn try_get_log_entries<RB>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<NodeId>>
    where
        RB: RangeBounds<u64> + Clone + std::fmt::Debug + Send,
    {
        Ok(self.log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

/// Snapshot builder: deep-clones the admin state and persists the compressed
/// blob under the data directory.
pub struct FsmSnapshotBuilder {
    last_applied: Option<LogId<NodeId>>,
    last_membership: StoredMembership<NodeId, BasicNode>,
    fsm: Arc<AdminFsm>,
    data_dir: PathBuf,
}

impl RaftSnapshotBuilder<TypeConfig> for FsmSnapshotBuilder {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<NodeId>> {
        let admin_snapshot = self.fsm.snapshot();
        let data = encode_snapshot(&admin_snapshot)
            .map_err(|e| storage_io_error(ErrorVerb::Write, e))?;

        let snapshot_id = format!(
            "snapshot-{}-{}",
            self.last_applied.map(|l| l.index).unwrap_or(0),
            admin_snapshot.snapshot_time
        );
        let meta = SnapshotMeta {
            last_log_id: self.last_applied,
            last_membership: self.last_membership.clone(),
            snapshot_id,
        };
        persist_snapshot(&self.data_dir, &meta, &data)
            .map_err(|e| storage_io_error(ErrorVerb::Write, e))?;
        metrics::SNAPSHOTS_TOTAL.inc();
        info!("Built snapshot '{}' ({} bytes)", meta.snapshot_id, data.len());

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

/// openraft v1 `RaftStorage` implementation. Wrapped by `Adaptor::new(store)`
/// to produce the v2 split traits.
impl RaftStorage<TypeConfig> for LogStore {
    type LogReader = MemLogReader;
    type SnapshotBuilder = FsmSnapshotBuilder;

    // --- Vote ---

    async fn save_vote(&mut self, vote: &Vote<NodeId>) -> Result<(), StorageError<NodeId>> {
        let content =
            serde_json::to_vec(vote).map_err(|e| storage_io_error(ErrorVerb::Write, e))?;
        write_atomically(&vote_path(&self.data_dir), &content)
            .map_err(|e| storage_io_error(ErrorVerb::Write, e))?;
        self.vote = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<NodeId>>, StorageError<NodeId>> {
        Ok(self.vote)
    }

    // --- Log ---

    async fn get_log_state(&mut self) -> Result<LogState<TypeConfig>, StorageError<NodeId>> {
        let last = self.log.values().next_back().map(|e| *e.get_log_id());
        let last = match last {
            None => self.last_purged,
            Some(l) => Some(l),
        };
        Ok(LogState {
            last_purged_log_id: self.last_purged,
            last_log_id: last,
        })
    }

    async fn save_committed(
        &mut self,
        committed: Option<LogId<NodeId>>,
    ) -> Result<(), StorageError<NodeId>> {
        self.committed = committed;
        Ok(())
    }

    async fn read_committed(&mut self) -> Result<Option<LogId<NodeId>>, StorageError<NodeId>> {
        Ok(self.committed)
    }

    async fn get_log_reader(&mut self) -> Self::LogReader {
        MemLogReader {
            log: self.log.clone(),
        }
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<NodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + Send,
    {
        for entry in entries {
            self.log.insert(entry.get_log_id().index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<NodeId>,
    ) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx < log_id.index);
        Ok(())
    }

    async fn purge_logs_upto(&mut self, log_id: LogId<NodeId>) -> Result<(), StorageError<NodeId>> {
        self.log.retain(|&idx, _| idx > log_id.index);
        self.last_purged = Some(log_id);
        Ok(())
    }

    // --- State machine ---

    async fn last_applied_state(
        &mut self,
    ) -> Result<(Option<LogId<NodeId>>, StoredMembership<NodeId, BasicNode>), StorageError<NodeId>>
    {
        Ok((self.last_applied, self.last_membership.clone()))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<ApplyOutcome>, StorageError<NodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let log_id = *entry.get_log_id();
            self.last_applied = Some(log_id);

            match &entry.payload {
                openraft::EntryPayload::Blank => {
                    responses.push(ApplyOutcome::ok("noop"));
                }
                openraft::EntryPayload::Normal(cmd) => {
                    let outcome = self.fsm.apply(log_id.index, log_id.leader_id.term, cmd);
                    responses.push(outcome);
                }
                openraft::EntryPayload::Membership(m) => {
                    self.last_membership = StoredMembership::new(Some(log_id), m.clone());
                    responses.push(ApplyOutcome::ok("membership change applied"));
                }
            }
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        FsmSnapshotBuilder {
            last_applied: self.last_applied,
            last_membership: self.last_membership.clone(),
            fsm: self.fsm.clone(),
            data_dir: self.data_dir.clone(),
        }
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<NodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<NodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<NodeId>> {
        let data = snapshot.get_ref().clone();
        let admin_snapshot =
            decode_snapshot(&data).map_err(|e| storage_io_error(ErrorVerb::Read, e))?;
        info!(
            "Installing snapshot '{}' covering up to index {}",
            meta.snapshot_id, admin_snapshot.last_applied_index
        );
        self.fsm.restore(admin_snapshot);
        self.last_applied = meta.last_log_id;
        self.last_membership = meta.last_membership.clone();
        persist_snapshot(&self.data_dir, meta, &data)
            .map_err(|e| storage_io_error(ErrorVerb::Write, e))?;
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<NodeId>> {
        match read_latest_snapshot(&self.data_dir)
            .map_err(|e| storage_io_error(ErrorVerb::Read, e))?
        {
            Some((meta, data)) => Ok(Some(Snapshot {
                meta,
                snapshot: Box::new(Cursor::new(data)),
            })),
            None => Ok(None),
        }
    }
}
