// src/core/raft/bus.rs

//! The server side of the raft bus: accepts peer connections and dispatches
//! decoded openraft RPCs into the local Raft instance.

use super::network::{BusRequest, BusResponse};
use super::{RaftInstance, TypeConfig};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use openraft::raft::{AppendEntriesRequest, InstallSnapshotRequest, VoteRequest};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::{Framed, LengthDelimitedCodec};
use tracing::{debug, error, info, warn};

/// Binds the raft bus listener and serves peer connections until shutdown.
pub async fn serve(
    bind_addr: String,
    raft: RaftInstance,
    mut shutdown_rx: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(&bind_addr).await?;
    info!("Raft bus listening on {}", bind_addr);

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Raft bus shutting down.");
                return Ok(());
            }
            res = listener.accept() => {
                match res {
                    Ok((socket, peer)) => {
                        debug!("Raft bus connection from {}", peer);
                        let raft = raft.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_connection(socket, raft).await {
                                warn!("Raft bus connection from {} ended: {}", peer, e);
                            }
                        });
                    }
                    Err(e) => error!("Raft bus accept failed: {}", e),
                }
            }
        }
    }
}

async fn handle_connection(socket: TcpStream, raft: RaftInstance) -> anyhow::Result<()> {
    let mut framed = Framed::new(socket, LengthDelimitedCodec::new());

    while let Some(frame) = framed.next().await {
        let frame = frame?;
        // Fail-close on a frame that does not decode: drop the connection.
        let (request, _) =
            bincode::decode_from_slice::<BusRequest, _>(&frame, bincode::config::standard())?;

        let response = dispatch(&raft, request).await;
        let encoded = bincode::encode_to_vec(&response, bincode::config::standard())?;
        framed.send(Bytes::from(encoded)).await?;
    }
    Ok(())
}

async fn dispatch(raft: &RaftInstance, request: BusRequest) -> BusResponse {
    match request {
        BusRequest::AppendEntries(payload) => {
            let rpc: AppendEntriesRequest<TypeConfig> = match serde_json::from_slice(&payload) {
                Ok(rpc) => rpc,
                Err(e) => return BusResponse::Err(format!("bad append_entries payload: {e}")),
            };
            match raft.append_entries(rpc).await {
                Ok(resp) => encode_response(&resp),
                Err(e) => BusResponse::Err(e.to_string()),
            }
        }
        BusRequest::Vote(payload) => {
            let rpc: VoteRequest<super::NodeId> = match serde_json::from_slice(&payload) {
                Ok(rpc) => rpc,
                Err(e) => return BusResponse::Err(format!("bad vote payload: {e}")),
            };
            match raft.vote(rpc).await {
                Ok(resp) => encode_response(&resp),
                Err(e) => BusResponse::Err(e.to_string()),
            }
        }
        BusRequest::InstallSnapshot(payload) => {
            let rpc: InstallSnapshotRequest<TypeConfig> = match serde_json::from_slice(&payload) {
                Ok(rpc) => rpc,
                Err(e) => return BusResponse::Err(format!("bad install_snapshot payload: {e}")),
            };
            match raft.install_snapshot(rpc).await {
                Ok(resp) => encode_response(&resp),
                Err(e) => BusResponse::Err(e.to_string()),
            }
        }
    }
}

fn encode_response<T: serde::Serialize>(resp: &T) -> BusResponse {
    match serde_json::to_vec(resp) {
        Ok(bytes) => BusResponse::Ok(bytes),
        Err(e) => BusResponse::Err(format!("response encode failed: {e}")),
    }
}
