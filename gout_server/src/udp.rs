//! UDP tunnel engine.
//!
//! One public UDP socket per tunnel. Inbound datagrams are wrapped in
//! envelopes and framed onto the control connection; envelopes coming back
//! from the agent are unwrapped and sent from the public socket to the
//! address each one names. Targets are not validated: the reply path
//! requires the agent to choose them.

use std::net::{Ipv4Addr, SocketAddr};

use anyhow::Context;
use gout_shared::config::RelayConfig;
use gout_shared::proto::{
    self, ControlWriter, Endpoint, Envelope, FrameBuffer, Protocol, MAX_DATAGRAM_BYTES,
};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tracing::{debug, info};

use crate::port::free_port;

pub(crate) async fn serve(
    mut rd: OwnedReadHalf,
    mut wr: OwnedWriteHalf,
    rest: Vec<u8>,
    cfg: &RelayConfig,
    public_ip: &str,
    upstream_port: u16,
) -> anyhow::Result<()> {
    let public_port = free_port(cfg.min_port, cfg.max_port).await?;
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, public_port))
        .await
        .with_context(|| format!("bind udp {public_port}"))?;

    info!(
        ip = %public_ip,
        port = public_port,
        upstream = upstream_port,
        "new udp tunnel"
    );

    let reply = Endpoint {
        ip: public_ip.to_string(),
        port: public_port,
        data_port: None,
        protocol: Some(Protocol::Udp),
    };
    proto::write_handshake(&mut wr, &reply)
        .await
        .context("send endpoint")?;

    let writer = ControlWriter::new(wr);

    // Whichever worker ends first ends the tunnel; dropping the other closes
    // the public socket and the control connection.
    tokio::select! {
        res = ingress(&socket, &writer) => res,
        res = egress(&mut rd, rest, &socket) => res,
    }
}

/// Public socket → control connection.
async fn ingress(
    socket: &UdpSocket,
    writer: &ControlWriter<OwnedWriteHalf>,
) -> anyhow::Result<()> {
    let mut buf = vec![0u8; MAX_DATAGRAM_BYTES];
    loop {
        let (n, from) = socket.recv_from(&mut buf).await.context("udp recv")?;
        let SocketAddr::V4(peer) = from else {
            debug!(%from, "ignoring non-IPv4 peer");
            continue;
        };
        let env = Envelope {
            peer,
            data: buf[..n].to_vec(),
        };
        writer
            .send_envelope(&env)
            .await
            .context("forward to agent")?;
    }
}

/// Control connection → public socket.
async fn egress(rd: &mut OwnedReadHalf, rest: Vec<u8>, socket: &UdpSocket) -> anyhow::Result<()> {
    let mut frames = FrameBuffer::with_initial(&rest);
    loop {
        match proto::read_envelope(rd, &mut frames)
            .await
            .context("read envelope")?
        {
            Some(env) => {
                socket
                    .send_to(&env.data, SocketAddr::V4(env.peer))
                    .await
                    .context("udp send")?;
            }
            None => {
                info!("control connection closed");
                return Ok(());
            }
        }
    }
}
