//! Loopback smoke runner: relay, agent, and an echo upstream in one process.
//!
//! Usage:
//!   loopback_runner [tcp|udp]
//!
//! Brings the full stack up on 127.0.0.1, pushes one probe through the
//! public endpoint, and exits 0 if the payload comes back intact.

use std::process::ExitCode;
use std::time::Duration;

use gout_client::ForwardClient;
use gout_server::ForwardServer;
use gout_shared::config::{AgentConfig, RelayConfig};
use gout_shared::proto::Protocol;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    gout_shared::logging::init("gout");

    let protocol = match std::env::args().nth(1).as_deref() {
        None | Some("tcp") => Protocol::Tcp,
        Some("udp") => Protocol::Udp,
        Some(other) => {
            eprintln!("unknown protocol: {other}");
            eprintln!("Usage: loopback_runner [tcp|udp]");
            return ExitCode::FAILURE;
        }
    };

    match run(protocol).await {
        Ok(()) => {
            println!("smoke {protocol}: ok");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("smoke {protocol}: failed: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(protocol: Protocol) -> anyhow::Result<()> {
    let relay_cfg = RelayConfig {
        return_ip: "127.0.0.1".into(),
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    };
    let server = ForwardServer::bind(relay_cfg, "127.0.0.1".into())?;
    let relay_addr = server.local_addr()?;
    tokio::spawn(server.run());

    let agent_cfg = AgentConfig {
        host: "127.0.0.1".into(),
        port: relay_addr.port(),
        ..Default::default()
    };

    match protocol {
        Protocol::Tcp => {
            let listener = TcpListener::bind("127.0.0.1:0").await?;
            let upstream_port = listener.local_addr()?.port();
            tokio::spawn(async move {
                while let Ok((mut stream, _)) = listener.accept().await {
                    tokio::spawn(async move {
                        let (mut rd, mut wr) = stream.split();
                        let _ = tokio::io::copy(&mut rd, &mut wr).await;
                    });
                }
            });

            let client = ForwardClient::connect(&agent_cfg, protocol, upstream_port).await?;
            let endpoint = client.endpoint().clone();
            tokio::spawn(client.serve());
            println!("public endpoint: {}:{}", endpoint.ip, endpoint.port);

            let mut external = TcpStream::connect((endpoint.ip.as_str(), endpoint.port)).await?;
            external.write_all(b"smoke").await?;
            let mut buf = [0u8; 5];
            timeout(WAIT, external.read_exact(&mut buf)).await??;
            anyhow::ensure!(&buf == b"smoke", "echo mismatch");
        }
        Protocol::Udp => {
            let socket = UdpSocket::bind("127.0.0.1:0").await?;
            let upstream_port = socket.local_addr()?.port();
            tokio::spawn(async move {
                let mut buf = [0u8; 2048];
                while let Ok((n, from)) = socket.recv_from(&mut buf).await {
                    let _ = socket.send_to(&buf[..n], from).await;
                }
            });

            let client = ForwardClient::connect(&agent_cfg, protocol, upstream_port).await?;
            let endpoint = client.endpoint().clone();
            tokio::spawn(client.serve());
            println!("public endpoint: {}:{}", endpoint.ip, endpoint.port);

            let probe = UdpSocket::bind("127.0.0.1:0").await?;
            probe
                .send_to(b"smoke", (endpoint.ip.as_str(), endpoint.port))
                .await?;
            let mut buf = [0u8; 64];
            let (n, _) = timeout(WAIT, probe.recv_from(&mut buf)).await??;
            anyhow::ensure!(&buf[..n] == b"smoke", "echo mismatch");
        }
    }
    Ok(())
}
