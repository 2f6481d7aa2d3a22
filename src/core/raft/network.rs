// src/core/raft/network.rs

//! The client side of the raft bus: per-peer framed TCP connections carrying
//! JSON-serialized openraft RPCs as opaque payload frames.

use super::{NodeId, TypeConfig};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use openraft::error::{InstallSnapshotError, RPCError, RaftError, Unreachable};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use openraft::{AnyError, BasicNode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);
const RPC_TIMEOUT: Duration = Duration::from_secs(3);

/// One raft bus frame from caller to peer. The payload bytes are the
/// JSON-serialized openraft request.
#[derive(Debug, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum BusRequest {
    AppendEntries(Vec<u8>),
    Vote(Vec<u8>),
    InstallSnapshot(Vec<u8>),
}

/// The peer's answer: the JSON-serialized openraft response, or a failure.
#[derive(Debug, Serialize, Deserialize, bincode::Encode, bincode::Decode)]
pub enum BusResponse {
    Ok(Vec<u8>),
    Err(String),
}

fn unreachable(msg: impl std::fmt::Display) -> Unreachable {
    Unreachable::new(&AnyError::error(msg.to_string()))
}

/// Per-peer raft bus client. Connects lazily on the first RPC and drops the
/// connection on any error so the next RPC redials.
pub struct BusNetwork {
    target_addr: String,
    conn: Option<Framed<TcpStream, LengthDelimitedCodec>>,
}

impl BusNetwork {
    async fn ensure_connected(
        &mut self,
    ) -> Result<&mut Framed<TcpStream, LengthDelimitedCodec>, String> {
        if self.conn.is_none() {
            let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(&self.target_addr))
                .await
                .map_err(|_| format!("connect to {} timed out", self.target_addr))?
                .map_err(|e| format!("connect to {} failed: {e}", self.target_addr))?;
            self.conn = Some(Framed::new(stream, LengthDelimitedCodec::new()));
        }
        Ok(self.conn.as_mut().expect("connection just established"))
    }

    async fn request(&mut self, req: BusRequest) -> Result<Vec<u8>, String> {
        let result = tokio::time::timeout(RPC_TIMEOUT, self.request_inner(req)).await;
        match result {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err(e)) => {
                self.conn = None;
                Err(e)
            }
            Err(_) => {
                self.conn = None;
                Err(format!("raft bus RPC to {} timed out", self.target_addr))
            }
        }
    }

    async fn request_inner(&mut self, req: BusRequest) -> Result<Vec<u8>, String> {
        let frame = bincode::encode_to_vec(&req, bincode::config::standard())
            .map_err(|e| format!("bus encode failed: {e}"))?;
        let conn = self.ensure_connected().await?;
        conn.send(Bytes::from(frame))
            .await
            .map_err(|e| format!("bus send failed: {e}"))?;
        let response = conn
            .next()
            .await
            .ok_or_else(|| "bus connection closed".to_string())?
            .map_err(|e| format!("bus read failed: {e}"))?;
        let (decoded, _) =
            bincode::decode_from_slice::<BusResponse, _>(&response, bincode::config::standard())
                .map_err(|e| format!("bus decode failed: {e}"))?;
        match decoded {
            BusResponse::Ok(payload) => Ok(payload),
            BusResponse::Err(e) => Err(e),
        }
    }
}

impl RaftNetwork<TypeConfig> for BusNetwork {
    async fn append_entries(
        &mut self,
        rpc: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let response = self
            .request(BusRequest::AppendEntries(payload))
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&response).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn vote(
        &mut self,
        rpc: VoteRequest<NodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<NodeId>, RPCError<NodeId, BasicNode, RaftError<NodeId>>> {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let response = self
            .request(BusRequest::Vote(payload))
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&response).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }

    async fn install_snapshot(
        &mut self,
        rpc: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<NodeId>,
        RPCError<NodeId, BasicNode, RaftError<NodeId, InstallSnapshotError>>,
    > {
        let payload =
            serde_json::to_vec(&rpc).map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        let response = self
            .request(BusRequest::InstallSnapshot(payload))
            .await
            .map_err(|e| RPCError::Unreachable(unreachable(e)))?;
        serde_json::from_slice(&response).map_err(|e| RPCError::Unreachable(unreachable(e)))
    }
}

/// Creates `BusNetwork` instances per target peer node.
pub struct BusNetworkFactory;

impl RaftNetworkFactory<TypeConfig> for BusNetworkFactory {
    type Network = BusNetwork;

    async fn new_client(&mut self, _target: NodeId, node: &BasicNode) -> Self::Network {
        BusNetwork {
            target_addr: node.addr.clone(),
            conn: None,
        }
    }
}
