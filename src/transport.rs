use std::{net::SocketAddr, time::Duration};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::{io::{AsyncReadExt, AsyncWriteExt}, net::{TcpStream, ToSocketAddrs, UdpSocket}};
use tracing::debug;
use url::Url;

use crate::config::SPA_PORT;
use crate::error::{Error, Result};


const READ_SIZE: usize = 4096;


/// A connection to one controller.
///
/// Not shared: a poll holds the transport exclusively for its duration.
#[async_trait]
pub trait Transport: Send {
    async fn send(&mut self, data: &[u8]) -> Result<()>;

    /// Wait up to `timeout` for bytes from the controller.
    ///
    /// Returns `Ok(None)` if nothing arrived in time.
    async fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>>;
}

/// Connectionless socket used to probe for controllers.
#[async_trait]
pub trait DatagramTransport: Send + Sync {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;
}


pub struct TcpTransport {
    stream: TcpStream,
    buffer: BytesMut,
}

impl TcpTransport {
    pub fn new(stream: TcpStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::with_capacity(READ_SIZE),
        }
    }

    pub async fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;

        Ok(Self::new(stream))
    }

    /// Connect to a `tcp://host[:port]` URL. The port defaults to [`SPA_PORT`].
    pub async fn open(url: &Url) -> Result<Self> {
        match url.scheme() {
            "tcp" => {
                let host = url.host_str()
                    .ok_or_else(|| Error::MissingHost(url.clone()))?;

                let port = url.port().unwrap_or(SPA_PORT);

                debug!("connecting to {host}:{port}");

                Self::connect((host, port)).await
            },
            other => Err(Error::UnsupportedScheme(other.to_string())),
        }
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    pub fn into_inner(self) -> TcpStream {
        self.stream
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&mut self, data: &[u8]) -> Result<()> {
        self.stream.write_all(data).await?;
        Ok(())
    }

    async fn receive(&mut self, timeout: Duration) -> Result<Option<Bytes>> {
        self.buffer.reserve(READ_SIZE);

        match tokio::time::timeout(timeout, self.stream.read_buf(&mut self.buffer)).await {
            Err(_) => Ok(None),
            Ok(Ok(0)) => Err(Error::Closed),
            Ok(Ok(_)) => Ok(Some(self.buffer.split().freeze())),
            Ok(Err(err)) => Err(err.into()),
        }
    }
}


#[async_trait]
impl DatagramTransport for UdpSocket {
    async fn send_to(&self, data: &[u8], target: SocketAddr) -> Result<()> {
        UdpSocket::send_to(self, data, target).await?;
        Ok(())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        Ok(UdpSocket::recv_from(self, buf).await?)
    }
}


#[cfg(test)]
mod tests {
    use tokio::net::TcpListener;

    use super::*;

    #[tokio::test]
    async fn test_tcp_transport() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let url = Url::parse(&format!("tcp://127.0.0.1:{}", addr.port())).unwrap();
        let (transport, accepted) = tokio::join!(TcpTransport::open(&url), listener.accept());

        let mut transport = transport.unwrap();
        let (mut peer, _) = accepted.unwrap();

        transport.send(b"ping").await.unwrap();
        let mut buf = [0; 4];
        peer.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        // nothing sent yet
        assert_eq!(transport.receive(Duration::from_millis(20)).await.unwrap(), None);

        peer.write_all(b"pong").await.unwrap();
        let received = transport.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(received.as_deref(), Some(&b"pong"[..]));

        drop(peer);
        assert!(matches!(transport.receive(Duration::from_secs(5)).await, Err(Error::Closed)));
    }

    #[tokio::test]
    async fn test_open_rejects_bad_urls() {
        let url = Url::parse("serial:///dev/ttyUSB0").unwrap();
        assert!(matches!(TcpTransport::open(&url).await, Err(Error::UnsupportedScheme(scheme)) if scheme == "serial"));

        let url = Url::parse("tcp:/no-host").unwrap();
        assert!(matches!(TcpTransport::open(&url).await, Err(Error::MissingHost(_))));
    }

    #[tokio::test]
    async fn test_udp_transport() {
        let a = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        DatagramTransport::send_to(&a, b"hello", b.local_addr().unwrap()).await.unwrap();

        let mut buf = [0; 16];
        let (n, from) = DatagramTransport::recv_from(&b, &mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(from, a.local_addr().unwrap());
    }
}
