//! Socket Provider Seam
//!
//! The engine never touches OS sockets directly. Connections to real
//! destinations and datagram sockets are obtained from an
//! `AsyncSocketProvider`, so the transport behind a link (a direct
//! connection, a SOCKS5 tunnel, a test double) is chosen by the embedder.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::{Mutex, Notify};

use crate::error::{Result, TapNatError};

/// A connected stream carrying one link's payload
#[async_trait]
pub trait LinkSocket: Send + Sync {
    /// Write all of `buf`
    async fn send(&self, buf: &[u8]) -> Result<usize>;

    /// Read into `buf`; `Ok(0)` means the peer closed
    async fn receive(&self, buf: &mut [u8]) -> Result<usize>;

    /// Signal end of stream to the peer, keeping the receive side open
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }

    /// Close the socket and wake pending operations. Idempotent.
    fn close(&self);

    fn is_closed(&self) -> bool;
}

/// An unconnected datagram socket
#[async_trait]
pub trait DatagramSocket: Send + Sync {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize>;

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)>;

    /// Close the socket and wake a pending receive. Idempotent.
    fn close(&self);
}

/// Source of sockets for links and UDP port entries
#[async_trait]
pub trait AsyncSocketProvider: Send + Sync {
    /// Open a stream to `destination`
    async fn connect(&self, destination: SocketAddr) -> Result<Arc<dyn LinkSocket>>;

    /// Bind a fresh datagram socket
    async fn bind_datagram(&self) -> Result<Arc<dyn DatagramSocket>>;
}

fn closed_error() -> TapNatError {
    TapNatError::SocketError("socket closed".into())
}

/// `LinkSocket` over a tokio TCP stream
pub struct TcpLinkSocket {
    reader: Mutex<OwnedReadHalf>,
    writer: Mutex<OwnedWriteHalf>,
    closed: AtomicBool,
    closing: Notify,
}

impl TcpLinkSocket {
    pub fn new(stream: TcpStream) -> Self {
        let (reader, writer) = stream.into_split();
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }
}

#[async_trait]
impl LinkSocket for TcpLinkSocket {
    async fn send(&self, buf: &[u8]) -> Result<usize> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.is_closed() {
            return Err(closed_error());
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            result = writer.write_all(buf) => {
                result?;
                Ok(buf.len())
            }
            _ = &mut closing => Err(closed_error()),
        }
    }

    async fn receive(&self, buf: &mut [u8]) -> Result<usize> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.is_closed() {
            return Ok(0);
        }

        let mut reader = self.reader.lock().await;
        tokio::select! {
            result = reader.read(buf) => Ok(result?),
            _ = &mut closing => Ok(0),
        }
    }

    async fn shutdown(&self) -> Result<()> {
        if self.is_closed() {
            return Err(closed_error());
        }
        self.writer.lock().await.shutdown().await?;
        Ok(())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closing.notify_waiters();
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// `DatagramSocket` over a tokio UDP socket
pub struct UdpDatagramSocket {
    socket: UdpSocket,
    closed: AtomicBool,
    closing: Notify,
}

impl UdpDatagramSocket {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
            closing: Notify::new(),
        }
    }
}

#[async_trait]
impl DatagramSocket for UdpDatagramSocket {
    async fn send_to(&self, buf: &[u8], target: SocketAddr) -> Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(self.socket.send_to(buf, target).await?)
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr)> {
        let closing = self.closing.notified();
        tokio::pin!(closing);
        closing.as_mut().enable();
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }

        tokio::select! {
            result = self.socket.recv_from(buf) => Ok(result?),
            _ = &mut closing => Err(closed_error()),
        }
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.closing.notify_waiters();
        }
    }
}

/// Connects straight to the destination from the host
pub struct DirectSocketProvider {
    connect_timeout: Duration,
}

impl DirectSocketProvider {
    pub fn new() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }
}

impl Default for DirectSocketProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AsyncSocketProvider for DirectSocketProvider {
    async fn connect(&self, destination: SocketAddr) -> Result<Arc<dyn LinkSocket>> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(destination))
            .await
            .map_err(|_| TapNatError::SocketError(format!("connect to {} timed out", destination)))??;
        stream.set_nodelay(true)?;
        Ok(Arc::new(TcpLinkSocket::new(stream)))
    }

    async fn bind_datagram(&self) -> Result<Arc<dyn DatagramSocket>> {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        Ok(Arc::new(UdpDatagramSocket::new(socket)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_direct_connect_and_echo() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 16];
            let n = stream.read(&mut buf).await.unwrap();
            stream.write_all(&buf[..n]).await.unwrap();
        });

        let provider = DirectSocketProvider::new();
        let socket = provider.connect(addr).await.unwrap();
        assert_eq!(socket.send(b"ping").await.unwrap(), 4);

        let mut buf = [0u8; 16];
        let n = socket.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
    }

    #[tokio::test]
    async fn test_close_wakes_receive() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move { listener.accept().await.unwrap() });

        let socket = DirectSocketProvider::new().connect(addr).await.unwrap();
        let _peer = server.await.unwrap();

        let reader = Arc::clone(&socket);
        let pending = tokio::spawn(async move {
            let mut buf = [0u8; 16];
            reader.receive(&mut buf).await.unwrap()
        });
        tokio::task::yield_now().await;

        socket.close();
        socket.close();
        assert!(socket.is_closed());
        assert_eq!(pending.await.unwrap(), 0);
        assert!(socket.send(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        // Bind then drop to find a port with nothing listening
        let addr = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap()
        };
        let provider = DirectSocketProvider::new().with_connect_timeout(Duration::from_secs(2));
        assert!(provider.connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_datagram_round_trip() {
        let provider = DirectSocketProvider::new();
        let a = provider.bind_datagram().await.unwrap();
        let b = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let b_addr = b.local_addr().unwrap();

        a.send_to(b"hello", b_addr).await.unwrap();
        let mut buf = [0u8; 16];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");

        b.send_to(b"back", ("127.0.0.1", from.port())).await.unwrap();
        let (n, _) = a.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"back");
    }
}
