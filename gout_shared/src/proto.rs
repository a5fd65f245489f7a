//! Control-plane wire format.
//!
//! Three things travel over the control connection:
//! - one JSON handshake object in each direction at startup,
//! - for TCP tunnels, newline-delimited `NEW_CONN` notifications from the
//!   relay to the agent,
//! - for UDP tunnels, length-prefixed datagram envelopes in both directions.
//!
//! The control connection never carries TCP payload bytes; those go over
//! dedicated rendezvous connections.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use bytes::{Buf, BufMut, BytesMut};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Handshake read buffer. Each side reads the peer's handshake with a single
/// `read` into a buffer of this size.
pub const MAX_HANDSHAKE_BYTES: usize = 4096;

/// Largest datagram an envelope may carry.
pub const MAX_DATAGRAM_BYTES: usize = 65535;

/// Envelope payload bytes preceding the datagram: inner length + IPv4 + port.
pub const ENVELOPE_HEADER_BYTES: usize = 10;

/// Token the relay writes for each inbound public connection.
pub const NEW_CONN: &str = "NEW_CONN";

/// The token as it appears on the wire.
pub const NEW_CONN_LINE: &[u8] = b"NEW_CONN\n";

#[derive(Debug, Error)]
pub enum ProtoError {
    #[error("envelope length {outer} does not match datagram length {inner}")]
    LengthMismatch { outer: u32, inner: u32 },
    #[error("envelope too large: {0} bytes")]
    Oversize(u32),
    #[error("envelope shorter than its header")]
    Truncated,
    #[error("connection closed mid-frame")]
    UnexpectedEof,
    #[error("handshake: {0}")]
    Handshake(#[from] serde_json::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Tunnel transport protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Tcp,
    Udp,
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        })
    }
}

/// Agent → relay registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Register {
    pub protocol: Protocol,
    /// Upstream service port on the agent's loopback; opaque to the relay.
    pub port: u16,
    pub password: String,
}

/// Relay → agent reply on a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    /// Public IP external traffic should use.
    pub ip: String,
    /// Allocated public port.
    pub port: u16,
    /// Rendezvous listener port; present for TCP tunnels only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_port: Option<u16>,
    /// Echoed back for UDP tunnels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
}

/// Writes one handshake object: a single JSON value, no terminator.
pub async fn write_handshake<W, T>(w: &mut W, msg: &T) -> Result<(), ProtoError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    w.write_all(&body).await?;
    Ok(())
}

/// Reads one handshake object with a single `read`.
///
/// Bytes past the JSON value (a coalesced notification or an early envelope)
/// are returned so the caller can seed its line/frame buffer with them.
pub async fn read_handshake<R, T>(r: &mut R) -> Result<(T, Vec<u8>), ProtoError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut buf = vec![0u8; MAX_HANDSHAKE_BYTES];
    let n = r.read(&mut buf).await?;
    if n == 0 {
        return Err(ProtoError::UnexpectedEof);
    }

    let mut values = serde_json::Deserializer::from_slice(&buf[..n]).into_iter::<T>();
    match values.next() {
        Some(Ok(msg)) => {
            let rest = buf[values.byte_offset()..n].to_vec();
            Ok((msg, rest))
        }
        Some(Err(e)) => Err(ProtoError::Handshake(e)),
        None => {
            use serde::de::Error;
            Err(ProtoError::Handshake(serde_json::Error::custom(
                "empty handshake",
            )))
        }
    }
}

/// One UDP datagram and the external peer it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub peer: SocketAddrV4,
    pub data: Vec<u8>,
}

impl Envelope {
    /// Encodes the full frame: outer length, inner length, IPv4, port, data.
    pub fn encode(&self) -> BytesMut {
        debug_assert!(self.data.len() <= MAX_DATAGRAM_BYTES);
        let n = self.data.len();
        let mut buf = BytesMut::with_capacity(4 + ENVELOPE_HEADER_BYTES + n);
        buf.put_u32((ENVELOPE_HEADER_BYTES + n) as u32);
        buf.put_u32(n as u32);
        buf.put_slice(&self.peer.ip().octets());
        buf.put_u16(self.peer.port());
        buf.put_slice(&self.data);
        buf
    }
}

/// Incremental envelope decoder.
///
/// Accumulates stream bytes until the outer length is present, then until the
/// whole frame is present, then emits one envelope; arbitrary TCP
/// fragmentation is tolerated.
#[derive(Debug, Default)]
pub struct FrameBuffer {
    buf: BytesMut,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the buffer with bytes that arrived coalesced with the
    /// handshake reply.
    pub fn with_initial(bytes: &[u8]) -> Self {
        Self {
            buf: BytesMut::from(bytes),
        }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Emits the next complete envelope, or `None` until more bytes arrive.
    ///
    /// An outer length shorter than the envelope header, larger than the
    /// datagram limit, or disagreeing with the inner length is a protocol
    /// error; the tunnel must be torn down.
    pub fn next_envelope(&mut self) -> Result<Option<Envelope>, ProtoError> {
        if self.buf.len() < 4 {
            return Ok(None);
        }
        let outer = u32::from_be_bytes([self.buf[0], self.buf[1], self.buf[2], self.buf[3]]);
        if (outer as usize) < ENVELOPE_HEADER_BYTES {
            return Err(ProtoError::Truncated);
        }
        if outer as usize > ENVELOPE_HEADER_BYTES + MAX_DATAGRAM_BYTES {
            return Err(ProtoError::Oversize(outer));
        }
        if self.buf.len() < 4 + outer as usize {
            return Ok(None);
        }

        self.buf.advance(4);
        let inner = self.buf.get_u32();
        if inner != outer - ENVELOPE_HEADER_BYTES as u32 {
            return Err(ProtoError::LengthMismatch { outer, inner });
        }
        let mut octets = [0u8; 4];
        self.buf.copy_to_slice(&mut octets);
        let port = self.buf.get_u16();
        let mut data = vec![0u8; inner as usize];
        self.buf.copy_to_slice(&mut data);

        Ok(Some(Envelope {
            peer: SocketAddrV4::new(Ipv4Addr::from(octets), port),
            data,
        }))
    }
}

/// Reads envelopes from `r`, buffering across reads.
///
/// Returns `Ok(None)` on a clean EOF at a frame boundary; EOF mid-frame is
/// an error.
pub async fn read_envelope<R>(
    r: &mut R,
    frames: &mut FrameBuffer,
) -> Result<Option<Envelope>, ProtoError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some(env) = frames.next_envelope()? {
            return Ok(Some(env));
        }
        let mut chunk = [0u8; 4096];
        let n = r.read(&mut chunk).await?;
        if n == 0 {
            return if frames.is_empty() {
                Ok(None)
            } else {
                Err(ProtoError::UnexpectedEof)
            };
        }
        frames.extend(&chunk[..n]);
    }
}

/// Splits the notification stream into newline-terminated lines regardless
/// of how TCP fragments it.
#[derive(Debug, Default)]
pub struct LineBuffer {
    buf: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_initial(bytes: &[u8]) -> Self {
        Self { buf: bytes.to_vec() }
    }

    pub fn extend(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Next complete line, without its terminator.
    pub fn next_line(&mut self) -> Option<String> {
        let pos = self.buf.iter().position(|&b| b == b'\n')?;
        let line: Vec<u8> = self.buf.drain(..=pos).collect();
        Some(String::from_utf8_lossy(&line[..pos]).into_owned())
    }
}

/// Serializes writes to the shared control connection so concurrent
/// producers never interleave partial envelopes.
#[derive(Debug)]
pub struct ControlWriter<W> {
    inner: Mutex<W>,
}

impl<W: AsyncWrite + Unpin> ControlWriter<W> {
    pub fn new(w: W) -> Self {
        Self {
            inner: Mutex::new(w),
        }
    }

    /// Writes one whole envelope frame.
    pub async fn send_envelope(&self, env: &Envelope) -> std::io::Result<()> {
        let frame = env.encode();
        let mut w = self.inner.lock().await;
        w.write_all(&frame).await
    }
}
