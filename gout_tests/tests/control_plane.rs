//! Control-plane probes with hand-written wire bytes: handshake rejection,
//! allocation failure, and fragmentation torture against a stand-in relay.

use std::net::SocketAddr;
use std::time::Duration;

use gout_client::ForwardClient;
use gout_server::ForwardServer;
use gout_shared::config::{AgentConfig, RelayConfig};
use gout_shared::proto::{self, Endpoint, Envelope, FrameBuffer, Protocol};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(5);

async fn start_relay(cfg: RelayConfig) -> anyhow::Result<SocketAddr> {
    let server = ForwardServer::bind(cfg, "127.0.0.1".into())?;
    let addr = server.local_addr()?;
    tokio::spawn(server.run());
    Ok(addr)
}

fn loopback_relay_config() -> RelayConfig {
    RelayConfig {
        return_ip: "127.0.0.1".into(),
        host: "127.0.0.1".into(),
        port: 0,
        ..Default::default()
    }
}

#[tokio::test]
async fn password_mismatch_closes_without_reply() -> anyhow::Result<()> {
    let relay = start_relay(loopback_relay_config()).await?;

    let mut control = TcpStream::connect(relay).await?;
    control
        .write_all(br#"{"protocol":"tcp","port":80,"password":"wrong"}"#)
        .await?;

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, control.read(&mut buf)).await??;
    assert_eq!(n, 0, "relay must close the control connection silently");
    Ok(())
}

#[tokio::test]
async fn malformed_handshake_closes_without_reply() -> anyhow::Result<()> {
    let relay = start_relay(loopback_relay_config()).await?;

    let mut control = TcpStream::connect(relay).await?;
    control.write_all(b"GET / HTTP/1.1\r\n\r\n").await?;

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, control.read(&mut buf)).await??;
    assert_eq!(n, 0);
    Ok(())
}

#[tokio::test]
async fn allocation_failure_closes_the_handshake() -> anyhow::Result<()> {
    let mut cfg = loopback_relay_config();
    // Ephemeral ports never land this low, so allocation always fails.
    cfg.min_port = 1;
    cfg.max_port = 2;
    let relay = start_relay(cfg).await?;

    let mut control = TcpStream::connect(relay).await?;
    control
        .write_all(br#"{"protocol":"tcp","port":9000,"password":"passwd@gout"}"#)
        .await?;

    let mut buf = [0u8; 64];
    let n = timeout(WAIT, control.read(&mut buf)).await??;
    assert_eq!(n, 0);
    Ok(())
}

#[tokio::test]
async fn tcp_reply_carries_ip_port_and_data_port() -> anyhow::Result<()> {
    let relay = start_relay(loopback_relay_config()).await?;

    let mut control = TcpStream::connect(relay).await?;
    control
        .write_all(br#"{"protocol":"tcp","port":9000,"password":"passwd@gout"}"#)
        .await?;

    let mut buf = [0u8; 1024];
    let n = timeout(WAIT, control.read(&mut buf)).await??;
    let endpoint: Endpoint = serde_json::from_slice(&buf[..n])?;
    assert_eq!(endpoint.ip, "127.0.0.1");
    assert!((1024..=65535).contains(&endpoint.port));
    assert!(endpoint.data_port.is_some());
    Ok(())
}

/// Stand-in relay: accepts the agent, answers the handshake by hand, and
/// returns the raw control stream for torture tests.
async fn accept_agent(
    listener: &TcpListener,
    reply: &[u8],
) -> anyhow::Result<TcpStream> {
    let (mut control, _) = listener.accept().await?;
    let mut buf = [0u8; 1024];
    let n = control.read(&mut buf).await?;
    anyhow::ensure!(n > 0, "agent closed before registering");
    control.write_all(reply).await?;
    Ok(control)
}

#[tokio::test]
async fn new_conn_token_split_across_reads_still_pairs() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = listener.local_addr()?;
    let rendezvous = TcpListener::bind("127.0.0.1:0").await?;
    let rendezvous_port = rendezvous.local_addr()?.port();
    let upstream = TcpListener::bind("127.0.0.1:0").await?;
    let upstream_port = upstream.local_addr()?.port();

    let cfg = AgentConfig {
        host: "127.0.0.1".into(),
        port: relay_addr.port(),
        ..Default::default()
    };
    let connecting =
        tokio::spawn(async move { ForwardClient::connect(&cfg, Protocol::Tcp, upstream_port).await });

    let reply = format!(
        r#"{{"ip":"127.0.0.1","port":33001,"data_port":{rendezvous_port}}}"#
    );
    let mut control = accept_agent(&listener, reply.as_bytes()).await?;
    let client = connecting.await??;
    tokio::spawn(client.serve());

    // One byte per write; the agent must still see exactly one token.
    for byte in proto::NEW_CONN_LINE {
        control.write_all(std::slice::from_ref(byte)).await?;
        control.flush().await?;
        tokio::time::sleep(Duration::from_millis(2)).await;
    }

    let (mut data, _) = timeout(WAIT, rendezvous.accept()).await??;
    let (mut up, _) = timeout(WAIT, upstream.accept()).await??;

    // And the pair really is bridged.
    data.write_all(b"x").await?;
    let mut one = [0u8; 1];
    timeout(WAIT, up.read_exact(&mut one)).await??;
    assert_eq!(&one, b"x");
    Ok(())
}

#[tokio::test]
async fn envelope_dribbled_byte_by_byte_reaches_upstream_once() -> anyhow::Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let relay_addr = listener.local_addr()?;
    let upstream = UdpSocket::bind("127.0.0.1:0").await?;
    let upstream_port = upstream.local_addr()?.port();

    let cfg = AgentConfig {
        host: "127.0.0.1".into(),
        port: relay_addr.port(),
        ..Default::default()
    };
    let connecting =
        tokio::spawn(async move { ForwardClient::connect(&cfg, Protocol::Udp, upstream_port).await });

    let mut control = accept_agent(
        &listener,
        br#"{"ip":"127.0.0.1","port":33000,"protocol":"udp"}"#,
    )
    .await?;
    let client = connecting.await??;
    tokio::spawn(client.serve());

    let peer = "203.0.113.9:4242".parse()?;
    let env = Envelope {
        peer,
        data: b"dribble".to_vec(),
    };
    let frame = env.encode();
    for byte in frame.iter() {
        control.write_all(std::slice::from_ref(byte)).await?;
        control.flush().await?;
    }

    let mut buf = [0u8; 64];
    let (n, session) = timeout(WAIT, upstream.recv_from(&mut buf)).await??;
    assert_eq!(&buf[..n], b"dribble");

    // Nothing else arrives: exactly one delivery.
    let extra = timeout(Duration::from_millis(300), upstream.recv_from(&mut buf)).await;
    assert!(extra.is_err(), "datagram must be delivered exactly once");

    // Reply path: the upstream answer comes back framed for the same peer.
    upstream.send_to(b"echo", session).await?;
    let mut frames = FrameBuffer::new();
    let reply = timeout(WAIT, proto::read_envelope(&mut control, &mut frames))
        .await??
        .expect("control closed before reply");
    assert_eq!(reply.peer, peer);
    assert_eq!(reply.data, b"echo");
    Ok(())
}
