//! Public address discovery for handshake replies.
//!
//! Runs once at startup when `return_ip` is not configured; the result is
//! treated as immutable configuration from then on.

use std::time::Duration;

use anyhow::{bail, Context};
use tracing::warn;

const SERVICES: &[&str] = &["https://ifconfig.co/ip", "https://icanhazip.com"];

const PROBE_TIMEOUT: Duration = Duration::from_secs(3);

/// Returns the relay's public IP as reported by the first reachable service.
pub async fn discover() -> anyhow::Result<String> {
    let client = reqwest::Client::builder()
        .timeout(PROBE_TIMEOUT)
        .build()
        .context("build http client")?;

    for url in SERVICES.iter().copied() {
        match fetch(&client, url).await {
            Ok(body) => {
                let ip = body.trim();
                if !ip.is_empty() {
                    return Ok(ip.to_string());
                }
            }
            Err(e) => warn!(url, error = %e, "public ip probe failed"),
        }
    }
    bail!("no public ip service reachable")
}

async fn fetch(client: &reqwest::Client, url: &str) -> reqwest::Result<String> {
    client.get(url).send().await?.text().await
}
