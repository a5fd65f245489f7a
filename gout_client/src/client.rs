//! Agent connection management.
//!
//! `ForwardClient` dials the relay, registers one upstream service, then
//! services the tunnel: for TCP it answers `NEW_CONN` notifications by
//! dialing the rendezvous listener and bridging to the upstream service;
//! for UDP it feeds inbound envelopes into the session table.

use std::net::Ipv4Addr;
use std::sync::Arc;

use anyhow::Context;
use gout_shared::config::AgentConfig;
use gout_shared::proto::{
    self, ControlWriter, Endpoint, FrameBuffer, LineBuffer, Protocol, Register,
};
use gout_shared::pump::pump;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::session::SessionTable;

/// Agent side of one tunnel registration.
pub struct ForwardClient {
    protocol: Protocol,
    upstream_port: u16,
    relay_host: String,
    endpoint: Endpoint,
    rd: OwnedReadHalf,
    wr: OwnedWriteHalf,
    /// Bytes that arrived coalesced with the handshake reply.
    rest: Vec<u8>,
}

impl ForwardClient {
    /// Connects to the relay and registers the upstream service.
    ///
    /// Any handshake failure (I/O, shape, rejection) is fatal for the
    /// control connection and surfaces here.
    pub async fn connect(
        cfg: &AgentConfig,
        protocol: Protocol,
        upstream_port: u16,
    ) -> anyhow::Result<Self> {
        info!(%protocol, port = upstream_port, host = %cfg.host, "registering");

        let control = TcpStream::connect((cfg.host.as_str(), cfg.port))
            .await
            .with_context(|| format!("connect relay {}:{}", cfg.host, cfg.port))?;
        let (mut rd, mut wr) = control.into_split();

        let register = Register {
            protocol,
            port: upstream_port,
            password: cfg.verify_password.clone(),
        };
        proto::write_handshake(&mut wr, &register)
            .await
            .context("send registration")?;

        let (endpoint, rest): (Endpoint, Vec<u8>) = proto::read_handshake(&mut rd)
            .await
            .context("read endpoint")?;
        info!(ip = %endpoint.ip, port = endpoint.port, "forward server");

        Ok(Self {
            protocol,
            upstream_port,
            relay_host: cfg.host.clone(),
            endpoint,
            rd,
            wr,
            rest,
        })
    }

    /// Public endpoint allocated by the relay.
    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Services the tunnel until the control connection ends.
    pub async fn serve(self) -> anyhow::Result<()> {
        match self.protocol {
            Protocol::Tcp => self.serve_tcp().await,
            Protocol::Udp => self.serve_udp().await,
        }
    }

    async fn serve_tcp(mut self) -> anyhow::Result<()> {
        let data_port = self
            .endpoint
            .data_port
            .context("endpoint missing data_port")?;

        let mut lines = LineBuffer::with_initial(&self.rest);
        let mut chunk = [0u8; 1024];
        loop {
            while let Some(line) = lines.next_line() {
                if line == proto::NEW_CONN {
                    self.open_data_connection(data_port).await?;
                } else if !line.is_empty() {
                    debug!(%line, "ignoring unknown notification");
                }
            }
            let n = self.rd.read(&mut chunk).await.context("read control")?;
            if n == 0 {
                info!("control connection closed");
                return Ok(());
            }
            lines.extend(&chunk[..n]);
        }
    }

    /// Dials the rendezvous listener, then bridges it to the upstream
    /// service. The rendezvous dial completes before the next notification
    /// is processed, preserving the relay's FIFO pairing; only the upstream
    /// dial and the pump run in their own task.
    async fn open_data_connection(&self, data_port: u16) -> anyhow::Result<()> {
        let data = TcpStream::connect((self.relay_host.as_str(), data_port))
            .await
            .context("connect rendezvous")?;

        let upstream_port = self.upstream_port;
        tokio::spawn(async move {
            let upstream = match TcpStream::connect((Ipv4Addr::LOCALHOST, upstream_port)).await {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(port = upstream_port, error = %e, "upstream connect failed");
                    return;
                }
            };
            let (inbound, outbound) = pump(data, upstream).await;
            debug!(inbound, outbound, "data connection closed");
        });
        Ok(())
    }

    async fn serve_udp(mut self) -> anyhow::Result<()> {
        let writer = Arc::new(ControlWriter::new(self.wr));
        let table = SessionTable::new(self.upstream_port, writer);

        let mut frames = FrameBuffer::with_initial(&self.rest);
        loop {
            match proto::read_envelope(&mut self.rd, &mut frames)
                .await
                .context("read envelope")?
            {
                Some(env) => table.forward(env.peer, env.data).await?,
                None => {
                    info!("control connection closed");
                    return Ok(());
                }
            }
        }
    }
}
