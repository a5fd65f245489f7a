//! Standalone agent binary.
//!
//! Usage:
//!   gout <tcp|udp> <local_port> [--config <file>]
//!
//! Registers the local service on `127.0.0.1:<local_port>` with the relay
//! and services forwarding requests until interrupted.

use std::env;
use std::process::ExitCode;

use anyhow::Context;
use gout_client::ForwardClient;
use gout_shared::config::AgentConfig;
use gout_shared::logging;
use gout_shared::proto::Protocol;
use tracing::{error, info};

const USAGE: &str = "Usage: gout <tcp|udp> <local_port> [--config <file>]";

/// `Ok(None)` means help was requested.
fn parse_args() -> anyhow::Result<Option<(AgentConfig, Protocol, u16)>> {
    let args: Vec<String> = env::args().skip(1).collect();
    if args.iter().any(|a| a == "-h" || a == "--help") {
        return Ok(None);
    }

    let mut cfg = AgentConfig::default();
    let mut positional = Vec::new();
    let mut i = 0;
    while i < args.len() {
        match args[i].as_str() {
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = AgentConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            flag if flag.starts_with('-') => anyhow::bail!("unknown argument: {flag}"),
            _ => {
                positional.push(args[i].clone());
                i += 1;
            }
        }
    }

    if positional.len() != 2 {
        anyhow::bail!("expected <protocol> <local_port>");
    }
    let protocol = match positional[0].as_str() {
        "tcp" => Protocol::Tcp,
        "udp" => Protocol::Udp,
        other => anyhow::bail!("unknown protocol: {other}"),
    };
    let port: u16 = positional[1].parse().context("parse local port")?;
    if port == 0 {
        anyhow::bail!("local port must be in 1..=65535");
    }
    Ok(Some((cfg, protocol, port)))
}

async fn run(cfg: AgentConfig, protocol: Protocol, port: u16) -> anyhow::Result<()> {
    let client = ForwardClient::connect(&cfg, protocol, port).await?;

    tokio::select! {
        res = client.serve() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("gout");

    let (cfg, protocol, port) = match parse_args() {
        Ok(Some(parsed)) => parsed,
        Ok(None) => {
            println!("{USAGE}");
            return ExitCode::SUCCESS;
        }
        Err(e) => {
            eprintln!("{e}");
            eprintln!("{USAGE}");
            return ExitCode::FAILURE;
        }
    };

    match run(cfg, protocol, port).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
