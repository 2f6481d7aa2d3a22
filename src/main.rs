// src/main.rs

//! The main entry point for the Citrine binary: control-plane node by
//! default, launcher agent under `--launcher`, admin CLI under `--admin`.

use anyhow::Result;
use citrine::config::{Config, FlagOverrides};
use citrine::server;
use std::env;
use tracing::error;
use tracing_subscriber::filter::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    run_app().await
}

async fn run_app() -> Result<()> {
    const VERSION: &str = env!("CARGO_PKG_VERSION");

    let args: Vec<String> = env::args().collect();

    if args.contains(&"--version".to_string()) {
        println!("Citrine version {VERSION}");
        return Ok(());
    }

    if args.len() > 1 && args[1] == "--launcher" {
        // --- Launcher Agent Mode ---

        if args.len() != 3 {
            eprintln!("Usage: citrine --launcher /path/to/launcher.toml");
            std::process::exit(1);
        }
        let config_path = &args[2];

        // Agent mode defaults to verbose launcher logs.
        let log_level = std::env::var("RUST_LOG")
            .unwrap_or_else(|_| "info,citrine::core::launcher=debug".to_string());
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::new(log_level))
            .compact()
            .with_ansi(true)
            .init();

        if let Err(e) = citrine::launcher::run(config_path).await {
            error!("Launcher agent runtime error: {}", e);
            return Err(e);
        }
        return Ok(());
    }

    if args.len() > 1 && args[1] == "--admin" {
        // --- Admin CLI Mode ---
        return citrine::cli::run(&args[2..]).await;
    }

    // --- Control-Plane Node Mode ---

    // Flag overrides carry the highest precedence and are applied during
    // config resolution so derived addresses see the final values.
    let mut flags = FlagOverrides::default();
    if let Some(id_index) = args.iter().position(|arg| arg == "--node-id") {
        match args.get(id_index + 1).map(|s| s.parse::<u64>()) {
            Some(Ok(id)) => flags.node_id = Some(id),
            _ => {
                eprintln!("--node-id flag requires a numeric value");
                std::process::exit(1);
            }
        }
    }
    if let Some(port_index) = args.iter().position(|arg| arg == "--port") {
        match args.get(port_index + 1).map(|s| s.parse::<u16>()) {
            Some(Ok(port)) => flags.raft_port = Some(port),
            _ => {
                eprintln!("--port flag requires a valid port number");
                std::process::exit(1);
            }
        }
    }

    let explicit_config = args
        .iter()
        .position(|arg| arg == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config = match explicit_config {
        Some(path) => match Config::from_file_with(path, flags) {
            Ok(cfg) => cfg,
            Err(e) => {
                eprintln!("Failed to load configuration from \"{path}\": {e:#}");
                std::process::exit(1);
            }
        },
        None => {
            // No explicit config: use ./config.toml when present, otherwise
            // single-node dev defaults.
            let default_path = "config.toml";
            if std::path::Path::new(default_path).exists() {
                match Config::from_file_with(default_path, flags) {
                    Ok(cfg) => cfg,
                    Err(e) => {
                        eprintln!("Failed to load configuration from \"{default_path}\": {e:#}");
                        std::process::exit(1);
                    }
                }
            } else {
                Config::default_single_node_with(flags)?
            }
        }
    };

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| config.log_level.clone());
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_level))
        .compact()
        .with_ansi(true)
        .init();

    if let Err(e) = server::run(config).await {
        error!("Node runtime error: {}", e);
        return Err(e);
    }

    Ok(())
}
