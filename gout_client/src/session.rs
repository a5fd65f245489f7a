//! Per-peer UDP sessions on the agent.
//!
//! Each distinct external peer gets its own loopback socket for talking to
//! the upstream service; replies read from that socket are wrapped in an
//! envelope for the same peer and framed back over the control connection.
//! Sessions live until the tunnel ends; there is no idle eviction.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;

use anyhow::Context;
use gout_shared::proto::{ControlWriter, Envelope, MAX_DATAGRAM_BYTES};
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::UdpSocket;
use tokio::sync::Mutex;
use tracing::{debug, warn};

pub struct SessionTable {
    upstream: SocketAddrV4,
    control: Arc<ControlWriter<OwnedWriteHalf>>,
    sessions: Mutex<HashMap<SocketAddrV4, Arc<UdpSocket>>>,
}

impl SessionTable {
    pub fn new(upstream_port: u16, control: Arc<ControlWriter<OwnedWriteHalf>>) -> Self {
        Self {
            upstream: SocketAddrV4::new(Ipv4Addr::LOCALHOST, upstream_port),
            control,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Sends `data` to the upstream service on behalf of `peer`, creating
    /// the session and its receive loop on first use.
    pub async fn forward(&self, peer: SocketAddrV4, data: Vec<u8>) -> anyhow::Result<()> {
        let socket = self.session(peer).await?;
        socket
            .send_to(&data, self.upstream)
            .await
            .context("upstream send")?;
        Ok(())
    }

    /// Number of live sessions.
    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    async fn session(&self, peer: SocketAddrV4) -> anyhow::Result<Arc<UdpSocket>> {
        let mut sessions = self.sessions.lock().await;
        if let Some(socket) = sessions.get(&peer) {
            return Ok(Arc::clone(socket));
        }

        let socket = UdpSocket::bind((Ipv4Addr::LOCALHOST, 0))
            .await
            .context("bind session socket")?;
        let socket = Arc::new(socket);
        debug!(
            %peer,
            local = %socket.local_addr().context("session local_addr")?,
            "new udp session"
        );
        tokio::spawn(recv_loop(
            Arc::clone(&socket),
            peer,
            Arc::clone(&self.control),
        ));
        sessions.insert(peer, Arc::clone(&socket));
        Ok(socket)
    }
}

/// Pulls upstream replies off the session socket and frames them back to
/// the relay addressed to `peer`. Ends when the socket or the control
/// connection fails.
async fn recv_loop(
    socket: Arc<UdpSocket>,
    peer: SocketAddrV4,
    control: Arc<ControlWriter<OwnedWriteHalf>>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((n, _)) => {
                let env = Envelope {
                    peer,
                    data: buf[..n].to_vec(),
                };
                if let Err(e) = control.send_envelope(&env).await {
                    warn!(%peer, error = %e, "control write failed");
                    return;
                }
            }
            Err(e) => {
                warn!(%peer, error = %e, "session socket error");
                return;
            }
        }
    }
}
