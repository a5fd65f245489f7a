//! Control-plane dispatcher.
//!
//! Accepts agent control connections, validates the registration handshake,
//! and hands the connection to the TCP or UDP tunnel engine. A tunnel owns
//! exactly one control connection plus every listener and socket it opens;
//! when the control connection ends, they all close.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use gout_shared::config::RelayConfig;
use gout_shared::proto::{self, Protocol, Register};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tracing::{info, warn};

use crate::{tcp, udp};

/// Binds a TCP listener with address reuse and the given backlog.
pub(crate) fn listen(addr: SocketAddr, backlog: u32) -> anyhow::Result<TcpListener> {
    let socket = TcpSocket::new_v4().context("tcp socket")?;
    socket.set_reuseaddr(true).context("set reuseaddr")?;
    socket.bind(addr).with_context(|| format!("bind {addr}"))?;
    socket.listen(backlog).context("listen")
}

/// The relay.
pub struct ForwardServer {
    cfg: Arc<RelayConfig>,
    public_ip: Arc<str>,
    listener: TcpListener,
}

impl ForwardServer {
    /// Binds the control listener. `public_ip` is the address handed out in
    /// handshake replies, resolved by the caller (configured or discovered).
    pub fn bind(cfg: RelayConfig, public_ip: String) -> anyhow::Result<Self> {
        let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port)
            .parse()
            .context("parse listen address")?;
        let listener = listen(addr, cfg.max_connections)?;
        Ok(Self {
            cfg: Arc::new(cfg),
            public_ip: public_ip.into(),
            listener,
        })
    }

    /// Control listener address (after binding).
    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serves control connections until the listener fails terminally.
    ///
    /// One misbehaving agent never stalls the accept loop: each control
    /// connection gets its own task, and transient accept errors are logged
    /// and skipped.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(public_ip = %self.public_ip, "public IP");
        info!(addr = %self.local_addr()?, "listening");

        loop {
            match self.listener.accept().await {
                Ok((control, peer)) => {
                    info!(%peer, "new control connection");
                    let cfg = Arc::clone(&self.cfg);
                    let public_ip = Arc::clone(&self.public_ip);
                    tokio::spawn(async move {
                        if let Err(e) = handle_agent(control, peer, cfg, public_ip).await {
                            warn!(%peer, error = %e, "tunnel ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "accept error");
                    continue;
                }
            }
        }
    }
}

/// Reads one registration, authorizes it, and runs the matching engine until
/// the tunnel ends.
async fn handle_agent(
    control: TcpStream,
    peer: SocketAddr,
    cfg: Arc<RelayConfig>,
    public_ip: Arc<str>,
) -> anyhow::Result<()> {
    let (mut rd, wr) = control.into_split();
    let (register, rest): (Register, Vec<u8>) = proto::read_handshake(&mut rd)
        .await
        .context("read registration")?;

    if register.password != cfg.verify_password {
        // Close before allocating anything.
        anyhow::bail!("invalid password from {peer}");
    }

    match register.protocol {
        Protocol::Tcp => tcp::serve(rd, wr, &cfg, &public_ip, peer, register.port).await,
        Protocol::Udp => udp::serve(rd, wr, rest, &cfg, &public_ip, register.port).await,
    }
}
