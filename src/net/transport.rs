//! Transport abstraction: anything that can carry framed bytes.
//!
//! Production peers run on `TcpStream`; tests run the identical peer code
//! over in-memory duplex pipes for deterministic simulated networks.

use crate::constants::CONNECT_TIMEOUT_SECS;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;

pub trait Transport: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin + 'static> Transport for T {}

pub type BoxedTransport = Box<dyn Transport>;

/// Outbound TCP connect with the protocol's attempt timeout.
pub async fn connect_tcp(addr: SocketAddr) -> std::io::Result<TcpStream> {
    connect_tcp_with_timeout(addr, Duration::from_secs(CONNECT_TIMEOUT_SECS)).await
}

pub async fn connect_tcp_with_timeout(
    addr: SocketAddr,
    timeout: Duration,
) -> std::io::Result<TcpStream> {
    match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(res) => res,
        Err(_) => Err(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            "connect attempt timed out",
        )),
    }
}

/// A linked pair of in-memory transports, one per side of a simulated
/// connection.
pub fn memory_pair() -> (DuplexStream, DuplexStream) {
    tokio::io::duplex(1 << 20)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn memory_pair_is_bidirectional() {
        let (mut a, mut b) = memory_pair();
        a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        b.write_all(b"pong").await.unwrap();
        a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }
}
