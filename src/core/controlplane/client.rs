// src/core/controlplane/client.rs

//! A framed request/response client for the control-plane RPC surface, used
//! by launcher agents, the admin CLI, and follower→leader forwarding.

use crate::core::controlplane::protocol::{
    RpcRequest, RpcResponse, decode_response, encode_request,
};
use crate::core::errors::CitrineError;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Dial budget when opening a connection to a control-plane node.
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-call budget covering send plus response.
const CALL_TIMEOUT: Duration = Duration::from_secs(10);

/// One persistent connection to a control-plane node.
pub struct ControlPlaneClient {
    addr: String,
    framed: Framed<TcpStream, LengthDelimitedCodec>,
}

impl ControlPlaneClient {
    pub async fn connect(addr: &str) -> Result<Self, CitrineError> {
        let stream = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(addr))
            .await
            .map_err(|_| CitrineError::Unavailable(format!("dial to {addr} timed out")))?
            .map_err(|e| CitrineError::Unavailable(format!("dial to {addr} failed: {e}")))?;
        Ok(Self {
            addr: addr.to_string(),
            framed: Framed::new(stream, LengthDelimitedCodec::new()),
        })
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Sends one request and awaits its response.
    pub async fn call(&mut self, req: &RpcRequest) -> Result<RpcResponse, CitrineError> {
        tokio::time::timeout(CALL_TIMEOUT, self.call_inner(req))
            .await
            .map_err(|_| CitrineError::Unavailable(format!("call to {} timed out", self.addr)))?
    }

    async fn call_inner(&mut self, req: &RpcRequest) -> Result<RpcResponse, CitrineError> {
        let frame = encode_request(req)?;
        self.framed
            .send(Bytes::from(frame))
            .await
            .map_err(|e| CitrineError::Unavailable(format!("send to {} failed: {e}", self.addr)))?;
        let response = self
            .framed
            .next()
            .await
            .ok_or_else(|| {
                CitrineError::Unavailable(format!("connection to {} closed", self.addr))
            })?
            .map_err(|e| CitrineError::Unavailable(format!("read from {} failed: {e}", self.addr)))?;
        decode_response(&response)
    }
}
