// src/cli.rs

//! The admin CLI: a thin client over the control-plane RPC surface.

use crate::core::commands::{AssignPatternCmd, CreateNamespaceCmd, RegisterProxyCmd};
use crate::core::controlplane::ControlPlaneClient;
use crate::core::controlplane::protocol::{RpcRequest, RpcResponse};
use anyhow::{Result, anyhow, bail};
use std::collections::BTreeMap;

const USAGE: &str = "Usage: citrine --admin <addr> <command> [key=value ...]

Commands:
  status
  register-proxy        id=<proxy-id> address=<host:port> [region=..] [version=..]
  create-namespace      name=<name> [created-by=..] [<key>=<value> ...]
  assign-pattern        id=<pattern-id> type=<pattern> launcher=<launcher-id> [namespace=..]
  get-namespace         name=<name>
  list-namespaces
  list-proxies
  list-launchers
  list-patterns";

/// Splits `key=value` arguments into a map; rejects anything else.
fn parse_options(args: &[String]) -> Result<BTreeMap<String, String>> {
    let mut options = BTreeMap::new();
    for arg in args {
        let (key, value) = arg
            .split_once('=')
            .ok_or_else(|| anyhow!("expected key=value, got '{arg}'"))?;
        options.insert(key.to_string(), value.to_string());
    }
    Ok(options)
}

fn required(options: &mut BTreeMap<String, String>, key: &str) -> Result<String> {
    options
        .remove(key)
        .ok_or_else(|| anyhow!("missing required option '{key}='"))
}

/// Runs one admin command against a control-plane node.
pub async fn run(args: &[String]) -> Result<()> {
    if args.len() < 2 {
        bail!("{USAGE}");
    }
    let addr = &args[0];
    let command = args[1].as_str();
    let mut options = parse_options(&args[2..])?;

    let request = match command {
        "status" => RpcRequest::ClusterStatus,
        "register-proxy" => RpcRequest::RegisterProxy(RegisterProxyCmd {
            proxy_id: required(&mut options, "id")?,
            address: required(&mut options, "address")?,
            region: options.remove("region").unwrap_or_else(|| "local".to_string()),
            version: options.remove("version").unwrap_or_else(|| "unknown".to_string()),
            capabilities: Default::default(),
            resources: Default::default(),
        }),
        "create-namespace" => RpcRequest::CreateNamespace(CreateNamespaceCmd {
            name: required(&mut options, "name")?,
            created_by: options
                .remove("created-by")
                .unwrap_or_else(|| "admin-cli".to_string()),
            assigned_proxy: options.remove("proxy"),
            config: options,
        }),
        "assign-pattern" => RpcRequest::AssignPattern(AssignPatternCmd {
            pattern_id: required(&mut options, "id")?,
            pattern_type: required(&mut options, "type")?,
            launcher_id: required(&mut options, "launcher")?,
            namespace: options.remove("namespace").unwrap_or_default(),
            config: options,
        }),
        "get-namespace" => RpcRequest::GetNamespace {
            name: required(&mut options, "name")?,
        },
        "list-namespaces" => RpcRequest::ListNamespaces,
        "list-proxies" => RpcRequest::ListProxies,
        "list-launchers" => RpcRequest::ListLaunchers,
        "list-patterns" => RpcRequest::ListPatterns,
        other => bail!("unknown command '{other}'\n\n{USAGE}"),
    };

    let mut client = ControlPlaneClient::connect(addr).await?;
    let response = client.call(&request).await?;
    print_response(response);
    Ok(())
}

fn print_response(response: RpcResponse) {
    match response {
        RpcResponse::ClusterStatus(status) => {
            println!("node:         {}", status.node_id);
            println!("leader:       {:?}", status.leader_id);
            println!(
                "leader addr:  {}",
                status.leader_address.unwrap_or_else(|| "-".to_string())
            );
            println!("is leader:    {}", status.is_leader);
            println!("term:         {}", status.term);
            println!("last applied: {}", status.last_applied_index);
            println!("members:      {}", status.members);
        }
        RpcResponse::RegisterProxy(ack) => {
            println!("success: {} ({})", ack.success, ack.message);
            for range in ack.partition_ranges {
                println!("partition range: {}..={}", range.start, range.end);
            }
            println!("namespaces in range: {}", ack.initial_namespaces.len());
        }
        RpcResponse::CreateNamespace(ack) => {
            println!("success: {} ({})", ack.success, ack.message);
            println!("partition: {}", ack.assigned_partition);
            println!("proxy:     {}", ack.assigned_proxy);
        }
        RpcResponse::Namespace(Some(ns)) => {
            println!(
                "{}  partition={}  proxy={}  created_by={}",
                ns.name, ns.partition_id, ns.assigned_proxy, ns.created_by
            );
        }
        RpcResponse::Namespace(None) => println!("(not found)"),
        RpcResponse::Namespaces(list) => {
            for ns in list {
                println!("{}  partition={}  proxy={}", ns.name, ns.partition_id, ns.assigned_proxy);
            }
        }
        RpcResponse::Proxy(Some(p)) => {
            println!("{}  {}  {}  {}", p.proxy_id, p.address, p.region, p.status);
        }
        RpcResponse::Proxy(None) => println!("(not found)"),
        RpcResponse::Proxies(list) => {
            for p in list {
                println!("{}  {}  {}  {}", p.proxy_id, p.address, p.region, p.status);
            }
        }
        RpcResponse::Launchers(list) => {
            for l in list {
                println!(
                    "{}  {}  {}  slots={}/{}",
                    l.launcher_id, l.address, l.status, l.available_slots, l.max_processes
                );
            }
        }
        RpcResponse::Patterns(list) => {
            for p in list {
                println!(
                    "{}  type={}  launcher={}  ns={}  {}",
                    p.pattern_id, p.pattern_type, p.launcher_id, p.namespace, p.status
                );
            }
        }
        RpcResponse::Ack(ack) => println!("success: {} ({})", ack.success, ack.message),
        RpcResponse::Heartbeat(ack) => {
            println!("success: {} (server time {})", ack.success, ack.server_timestamp)
        }
        RpcResponse::RegisterLauncher(ack) => {
            println!("success: {} ({})", ack.success, ack.message);
            println!("capacity: {}", ack.assigned_capacity);
        }
        RpcResponse::Error(failure) => {
            eprintln!("error ({:?}): {}", failure.code, failure.message)
        }
    }
}
