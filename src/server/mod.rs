// src/server/mod.rs

use crate::config::Config;
use anyhow::Result;

mod connection_loop;
mod context;
mod initialization;
mod metrics_server;

pub use connection_loop::await_shutdown_signal;
pub use metrics_server::run_metrics_server;

/// The main node startup function, orchestrating all setup phases.
pub async fn run(config: Config) -> Result<()> {
    // 1. Initialize mirror store, FSM, Raft, and listeners.
    let server_context = initialization::setup(config).await?;

    // 2. Start the main connection acceptance loop. This runs until shutdown.
    connection_loop::run(server_context).await;

    Ok(())
}
