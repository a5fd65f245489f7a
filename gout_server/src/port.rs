//! Public-port allocation.

use anyhow::{bail, Context};
use tokio::net::TcpListener;

/// Bind-probe attempts before giving up on the configured range.
const ALLOC_ATTEMPTS: u32 = 16;

/// Asks the OS for a free TCP port, keeping it only if it falls inside
/// `[min_port, max_port]` (inclusive).
///
/// The probe socket is closed before the caller rebinds the port, so another
/// process can claim it in between; the selector retries a bounded number of
/// times on an out-of-range pick and otherwise accepts the race.
pub async fn free_port(min_port: u16, max_port: u16) -> anyhow::Result<u16> {
    for _ in 0..ALLOC_ATTEMPTS {
        let probe = TcpListener::bind(("0.0.0.0", 0))
            .await
            .context("bind port probe")?;
        let port = probe.local_addr().context("probe local_addr")?.port();
        drop(probe);
        if (min_port..=max_port).contains(&port) {
            return Ok(port);
        }
    }
    bail!("no free port in {min_port}..={max_port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allocated_port_is_in_range() -> anyhow::Result<()> {
        let port = free_port(1024, 65535).await?;
        assert!((1024..=65535).contains(&port));
        Ok(())
    }

    #[tokio::test]
    async fn impossible_range_fails() {
        // Ephemeral ports never land this low.
        assert!(free_port(1, 3).await.is_err());
    }
}
