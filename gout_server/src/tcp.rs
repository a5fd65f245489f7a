//! TCP tunnel engine.
//!
//! Owns one public listener and one rendezvous listener per agent. Each
//! inbound public connection is announced to the agent with a `NEW_CONN`
//! line, then matched to the next connection accepted on the rendezvous
//! listener. Notify and accept happen one at a time in the same loop, so
//! pairing stays FIFO even when connections arrive in a burst.
//!
//! Pairing assumes only the registered agent dials the rendezvous port.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use gout_shared::config::RelayConfig;
use gout_shared::proto::{self, Endpoint};
use gout_shared::pump::pump;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::port::free_port;
use crate::server::listen;

pub(crate) async fn serve(
    rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    cfg: &RelayConfig,
    public_ip: &str,
    agent: SocketAddr,
    upstream_port: u16,
) -> anyhow::Result<()> {
    let rendezvous = listen(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        cfg.max_connections,
    )?;
    let data_port = rendezvous
        .local_addr()
        .context("rendezvous local_addr")?
        .port();

    let public_port = free_port(cfg.min_port, cfg.max_port).await?;
    let public = listen(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, public_port)),
        cfg.max_connections,
    )?;

    info!(
        ip = %public_ip,
        port = public_port,
        agent = %agent,
        upstream = upstream_port,
        "new tcp tunnel"
    );

    let reply = Endpoint {
        ip: public_ip.to_string(),
        port: public_port,
        data_port: Some(data_port),
        protocol: None,
    };
    proto::write_handshake(&mut wr, &reply)
        .await
        .context("send endpoint")?;

    // Either the accept loop fails terminally (a listener or the control
    // write died) or the agent hangs up; both drop every owned listener.
    tokio::select! {
        res = accept_loop(&public, &rendezvous, &mut wr) => res,
        _ = control_closed(rd) => {
            info!(%agent, "control connection closed");
            Ok(())
        }
    }
}

/// Accepts public connections and pairs each with one rendezvous connection.
async fn accept_loop(
    public: &TcpListener,
    rendezvous: &TcpListener,
    wr: &mut OwnedWriteHalf,
) -> anyhow::Result<()> {
    loop {
        let (external, peer) = public.accept().await.context("accept external")?;
        debug!(%peer, "external connection");

        wr.write_all(proto::NEW_CONN_LINE)
            .await
            .context("notify agent")?;
        let (data, _) = rendezvous.accept().await.context("accept rendezvous")?;

        tokio::spawn(async move {
            let (inbound, outbound) = pump(external, data).await;
            debug!(%peer, inbound, outbound, "external connection closed");
        });
    }
}

/// Resolves when the agent side of the control connection goes away.
async fn control_closed(mut rd: OwnedReadHalf) {
    let mut buf = [0u8; 64];
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            // The agent sends nothing after the handshake; drain stray bytes.
            Ok(_) => {}
        }
    }
}
