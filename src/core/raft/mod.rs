// src/core/raft/mod.rs

//! Raft consensus for the admin state machine, built on the `openraft` crate.
//!
//! The node-to-node transport is the raft bus: a length-delimited TCP
//! protocol carrying JSON-serialized openraft RPCs as opaque payload frames.
//! Storage bridges openraft's log to the `AdminFsm` and persists the vote and
//! snapshots under the raft data directory.
//!
//! openraft's traits use RPITIT (return-position impl Trait in Trait) rather
//! than boxed futures; implementations must use plain `async fn`, not
//! `#[async_trait]`.

pub mod bus;
pub mod network;
pub mod node;
pub mod storage;

use crate::core::commands::{ApplyOutcome, Command};
use openraft::{BasicNode, Entry, TokioRuntime};
use std::io::Cursor;

pub type NodeId = u64;

// The `declare_raft_types!` macro generates the TypeConfig struct and all
// required trait impls.
openraft::declare_raft_types!(
    pub TypeConfig:
        D            = Command,
        R            = ApplyOutcome,
        NodeId       = NodeId,
        Node         = BasicNode,
        Entry        = Entry<TypeConfig>,
        SnapshotData = Cursor<Vec<u8>>,
        AsyncRuntime = TokioRuntime,
);

pub type RaftInstance = openraft::Raft<TypeConfig>;

pub use node::RaftNode;
