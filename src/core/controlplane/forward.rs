// src/core/controlplane/forward.rs

//! The leader connection pool used by followers to forward writes (and
//! leader-only reads): one pooled connection per leader address, created
//! lazily with a double-checked write lock.

use crate::core::controlplane::client::ControlPlaneClient;
use crate::core::controlplane::protocol::{RpcRequest, RpcResponse};
use crate::core::errors::CitrineError;
use crate::core::metrics;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Read-mostly pool of leader connections.
#[derive(Default)]
pub struct LeaderForwarder {
    pool: RwLock<HashMap<String, Arc<Mutex<ControlPlaneClient>>>>,
}

impl LeaderForwarder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forwards a request to the leader and passes the response through
    /// unchanged. Any transport failure drops the pooled connection and
    /// surfaces as unavailable.
    pub async fn forward(
        &self,
        leader_addr: &str,
        req: &RpcRequest,
    ) -> Result<RpcResponse, CitrineError> {
        metrics::RPC_FORWARDED_TOTAL.inc();
        let client = self.get_or_connect(leader_addr).await?;

        let result = {
            let mut guard = client.lock().await;
            guard.call(req).await
        };
        match result {
            Ok(resp) => Ok(resp),
            Err(e) => {
                warn!("Forward to leader {} failed: {}", leader_addr, e);
                self.pool.write().await.remove(leader_addr);
                Err(CitrineError::Unavailable(format!(
                    "leader {leader_addr} unreachable: {e}"
                )))
            }
        }
    }

    async fn get_or_connect(
        &self,
        leader_addr: &str,
    ) -> Result<Arc<Mutex<ControlPlaneClient>>, CitrineError> {
        if let Some(client) = self.pool.read().await.get(leader_addr) {
            return Ok(client.clone());
        }

        // Double-checked under the write lock.
        let mut pool = self.pool.write().await;
        if let Some(client) = pool.get(leader_addr) {
            return Ok(client.clone());
        }
        debug!("Opening pooled connection to leader {}", leader_addr);
        let client = ControlPlaneClient::connect(leader_addr)
            .await
            .map_err(|e| {
                CitrineError::Unavailable(format!("cannot reach leader {leader_addr}: {e}"))
            })?;
        let client = Arc::new(Mutex::new(client));
        pool.insert(leader_addr.to_string(), client.clone());
        Ok(client)
    }
}
