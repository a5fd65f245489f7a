//! Standalone relay binary.
//!
//! Usage:
//!   gout_server [--config <file>] [--host <addr>] [--port <port>] [--password <pw>]
//!
//! The relay accepts agent registrations on the control port and exposes one
//! public endpoint per registered agent. With an empty `return_ip` the
//! public address is discovered at startup.

use std::env;
use std::process::ExitCode;

use anyhow::Context;
use gout_server::{public_ip, ForwardServer};
use gout_shared::config::RelayConfig;
use gout_shared::logging;
use tracing::{error, info};

const USAGE: &str =
    "Usage: gout_server [--config <file>] [--host <addr>] [--port <port>] [--password <pw>]";

/// `Ok(None)` means help was requested.
fn parse_args() -> anyhow::Result<Option<RelayConfig>> {
    let args: Vec<String> = env::args().collect();
    let mut cfg = RelayConfig::default();
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-h" | "--help" => return Ok(None),
            "--config" if i + 1 < args.len() => {
                let text = std::fs::read_to_string(&args[i + 1])
                    .with_context(|| format!("read config {}", args[i + 1]))?;
                cfg = RelayConfig::from_json_str(&text).context("parse config")?;
                i += 2;
            }
            "--host" if i + 1 < args.len() => {
                cfg.host = args[i + 1].clone();
                i += 2;
            }
            "--port" if i + 1 < args.len() => {
                cfg.port = args[i + 1].parse().context("parse control port")?;
                i += 2;
            }
            "--password" if i + 1 < args.len() => {
                cfg.verify_password = args[i + 1].clone();
                i += 2;
            }
            other => anyhow::bail!("unknown argument: {other}"),
        }
    }
    Ok(Some(cfg))
}

async fn run(cfg: RelayConfig) -> anyhow::Result<()> {
    let public_ip = if cfg.return_ip.is_empty() {
        public_ip::discover().await.context("discover public ip")?
    } else {
        cfg.return_ip.clone()
    };

    let server = ForwardServer::bind(cfg, public_ip)?;

    tokio::select! {
        res = server.run() => res,
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted");
            Ok(())
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    logging::init("gout_server");

    let cfg = match parse_args() {
        Ok(Some(cfg)) => cfg,
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

    match run(cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("fatal: {e:#}");
            ExitCode::FAILURE
        }
    }
}
