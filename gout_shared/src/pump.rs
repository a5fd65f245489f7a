//! Full-duplex byte relay between two TCP streams.

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

/// Fixed read buffer per pump direction.
pub const COPY_BUF_BYTES: usize = 4096;

/// Copies `a` → `b` and `b` → `a` until each direction reaches EOF or fails.
///
/// When one direction ends, the half it was writing to is shut down so the
/// peer behind it sees EOF; the opposite direction keeps draining, which is
/// what lets a half-closed connection still deliver its response. Both
/// streams are fully closed when the pump returns. Shutdown errors from
/// already-closed sockets are ignored.
///
/// Returns the byte counts copied a→b and b→a.
pub async fn pump(a: TcpStream, b: TcpStream) -> (u64, u64) {
    let (a_rd, a_wr) = a.into_split();
    let (b_rd, b_wr) = b.into_split();
    tokio::join!(copy_then_shutdown(a_rd, b_wr), copy_then_shutdown(b_rd, a_wr))
}

async fn copy_then_shutdown(mut rd: OwnedReadHalf, mut wr: OwnedWriteHalf) -> u64 {
    let mut buf = [0u8; COPY_BUF_BYTES];
    let mut total = 0u64;
    loop {
        match rd.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if wr.write_all(&buf[..n]).await.is_err() {
                    break;
                }
                total += n as u64;
            }
        }
    }
    let _ = wr.shutdown().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// A connected loopback stream pair.
    async fn tcp_pair() -> anyhow::Result<(TcpStream, TcpStream)> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let connect = TcpStream::connect(addr);
        let accept = listener.accept();
        let (client, (server, _)) = tokio::try_join!(connect, accept)?;
        Ok((client, server))
    }

    #[tokio::test]
    async fn bytes_cross_in_both_directions() -> anyhow::Result<()> {
        let (mut left, left_inner) = tcp_pair().await?;
        let (right_inner, mut right) = tcp_pair().await?;
        let pumping = tokio::spawn(pump(left_inner, right_inner));

        left.write_all(b"ping").await?;
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong").await?;
        left.read_exact(&mut buf).await?;
        assert_eq!(&buf, b"pong");

        drop(left);
        drop(right);
        pumping.await?;
        Ok(())
    }

    #[tokio::test]
    async fn half_close_propagates_and_reverse_path_survives() -> anyhow::Result<()> {
        let (mut left, left_inner) = tcp_pair().await?;
        let (right_inner, mut right) = tcp_pair().await?;
        let pumping = tokio::spawn(pump(left_inner, right_inner));

        left.write_all(b"q").await?;
        left.shutdown().await?;

        // The far side sees the byte then EOF.
        let mut received = Vec::new();
        right.read_to_end(&mut received).await?;
        assert_eq!(received, b"q");

        // It can still answer over the surviving direction.
        right.write_all(b"bye").await?;
        right.shutdown().await?;

        let mut reply = Vec::new();
        left.read_to_end(&mut reply).await?;
        assert_eq!(reply, b"bye");

        let (fwd, back) = pumping.await?;
        assert_eq!((fwd, back), (1, 3));
        Ok(())
    }
}
