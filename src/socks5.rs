//! SOCKS5 Transport
//!
//! Carries link payload through a SOCKS5 server instead of connecting to the
//! destination directly. `Socks5SocketProvider` plugs the client into the
//! engine's `AsyncSocketProvider` seam.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::error::{Result, TapNatError};
use crate::socket::{
    AsyncSocketProvider, DatagramSocket, DirectSocketProvider, LinkSocket, TcpLinkSocket,
};

const SOCKS5_VERSION: u8 = 0x05;
/// Sub-negotiation version of RFC 1929 username/password auth
const USER_PASS_VERSION: u8 = 0x01;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// SOCKS5 authentication methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthMethod {
    NoAuth = 0x00,
    UsernamePassword = 0x02,
    NoAcceptable = 0xFF,
}

impl From<u8> for AuthMethod {
    fn from(value: u8) -> Self {
        match value {
            0x00 => AuthMethod::NoAuth,
            0x02 => AuthMethod::UsernamePassword,
            _ => AuthMethod::NoAcceptable,
        }
    }
}

/// SOCKS5 reply codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReplyCode {
    Succeeded = 0x00,
    GeneralFailure = 0x01,
    ConnectionNotAllowed = 0x02,
    NetworkUnreachable = 0x03,
    HostUnreachable = 0x04,
    ConnectionRefused = 0x05,
    TtlExpired = 0x06,
    CommandNotSupported = 0x07,
    AddressTypeNotSupported = 0x08,
}

impl From<u8> for ReplyCode {
    fn from(value: u8) -> Self {
        match value {
            0x00 => ReplyCode::Succeeded,
            0x02 => ReplyCode::ConnectionNotAllowed,
            0x03 => ReplyCode::NetworkUnreachable,
            0x04 => ReplyCode::HostUnreachable,
            0x05 => ReplyCode::ConnectionRefused,
            0x06 => ReplyCode::TtlExpired,
            0x07 => ReplyCode::CommandNotSupported,
            0x08 => ReplyCode::AddressTypeNotSupported,
            _ => ReplyCode::GeneralFailure,
        }
    }
}

impl std::fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let message = match self {
            ReplyCode::Succeeded => "succeeded",
            ReplyCode::GeneralFailure => "general SOCKS server failure",
            ReplyCode::ConnectionNotAllowed => "connection not allowed by ruleset",
            ReplyCode::NetworkUnreachable => "network unreachable",
            ReplyCode::HostUnreachable => "host unreachable",
            ReplyCode::ConnectionRefused => "connection refused",
            ReplyCode::TtlExpired => "TTL expired",
            ReplyCode::CommandNotSupported => "command not supported",
            ReplyCode::AddressTypeNotSupported => "address type not supported",
        };
        f.write_str(message)
    }
}

/// Append the SOCKS5 encoding of `addr` (ATYP, address, port)
fn put_address(buf: &mut BytesMut, addr: SocketAddr) {
    match addr {
        SocketAddr::V4(addr) => {
            buf.put_u8(ATYP_IPV4);
            buf.put_slice(&addr.ip().octets());
        }
        SocketAddr::V6(addr) => {
            buf.put_u8(ATYP_IPV6);
            buf.put_slice(&addr.ip().octets());
        }
    }
    buf.put_u16(addr.port());
}

/// Username/password credentials (RFC 1929)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Result<Self> {
        let credentials = Self {
            username: username.into(),
            password: password.into(),
        };
        if credentials.username.is_empty()
            || credentials.username.len() > u8::MAX as usize
            || credentials.password.len() > u8::MAX as usize
        {
            return Err(TapNatError::ConfigError(
                "SOCKS5 username and password must be 1-255 bytes".into(),
            ));
        }
        Ok(credentials)
    }
}

/// SOCKS5 client for CONNECT tunnels
#[derive(Debug, Clone)]
pub struct Socks5Client {
    proxy_addr: SocketAddr,
    credentials: Option<Credentials>,
}

impl Socks5Client {
    pub fn new(proxy_addr: SocketAddr) -> Self {
        Self {
            proxy_addr,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn proxy_addr(&self) -> SocketAddr {
        self.proxy_addr
    }

    /// Open a tunnel to `target` through the proxy
    pub async fn connect(&self, target: SocketAddr) -> Result<TcpStream> {
        let mut stream = TcpStream::connect(self.proxy_addr).await?;
        stream.set_nodelay(true)?;
        self.negotiate(&mut stream, target).await?;
        Ok(stream)
    }

    /// Run the greeting, optional authentication and CONNECT on `stream`
    pub async fn negotiate<S>(&self, stream: &mut S, target: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.greet(stream).await?;
        self.request_connect(stream, target).await
    }

    async fn greet<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut greeting = BytesMut::with_capacity(4);
        greeting.put_u8(SOCKS5_VERSION);
        if self.credentials.is_some() {
            greeting.put_slice(&[2, AuthMethod::NoAuth as u8, AuthMethod::UsernamePassword as u8]);
        } else {
            greeting.put_slice(&[1, AuthMethod::NoAuth as u8]);
        }
        stream.write_all(&greeting).await?;

        let mut choice = [0u8; 2];
        stream.read_exact(&mut choice).await?;
        if choice[0] != SOCKS5_VERSION {
            return Err(TapNatError::Socks5Error(format!(
                "unexpected version {} in method selection",
                choice[0]
            )));
        }

        match AuthMethod::from(choice[1]) {
            AuthMethod::NoAuth => Ok(()),
            AuthMethod::UsernamePassword => self.authenticate(stream).await,
            AuthMethod::NoAcceptable => {
                Err(TapNatError::Socks5Error("no acceptable auth method".into()))
            }
        }
    }

    async fn authenticate<S>(&self, stream: &mut S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            TapNatError::Socks5Error("server requires credentials but none are configured".into())
        })?;

        let mut request = BytesMut::with_capacity(3 + credentials.username.len() + credentials.password.len());
        request.put_u8(USER_PASS_VERSION);
        request.put_u8(credentials.username.len() as u8);
        request.put_slice(credentials.username.as_bytes());
        request.put_u8(credentials.password.len() as u8);
        request.put_slice(credentials.password.as_bytes());
        stream.write_all(&request).await?;

        let mut status = [0u8; 2];
        stream.read_exact(&mut status).await?;
        if status[1] != 0x00 {
            return Err(TapNatError::Socks5Error("authentication rejected".into()));
        }
        Ok(())
    }

    async fn request_connect<S>(&self, stream: &mut S, target: SocketAddr) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut request = BytesMut::with_capacity(22);
        request.put_slice(&[SOCKS5_VERSION, CMD_CONNECT, 0x00]);
        put_address(&mut request, target);
        stream.write_all(&request).await?;

        let mut header = [0u8; 4];
        stream.read_exact(&mut header).await?;
        if header[0] != SOCKS5_VERSION {
            return Err(TapNatError::Socks5Error(format!(
                "unexpected version {} in reply",
                header[0]
            )));
        }
        let reply = ReplyCode::from(header[1]);
        if reply != ReplyCode::Succeeded {
            return Err(TapNatError::Socks5Error(format!(
                "CONNECT {} failed: {}",
                target, reply
            )));
        }

        // Bound address is not needed; consume it so payload starts clean
        let remaining = match header[3] {
            ATYP_IPV4 => 4 + 2,
            ATYP_IPV6 => 16 + 2,
            ATYP_DOMAIN => {
                let mut len = [0u8; 1];
                stream.read_exact(&mut len).await?;
                len[0] as usize + 2
            }
            other => {
                return Err(TapNatError::Socks5Error(format!(
                    "unknown address type {} in reply",
                    other
                )))
            }
        };
        let mut bound = vec![0u8; remaining];
        stream.read_exact(&mut bound).await?;
        Ok(())
    }
}

/// Parse a proxy endpoint from an IP literal and port
pub fn proxy_endpoint(host: &str, port: u16) -> Result<SocketAddr> {
    if let Ok(ip) = host.parse::<Ipv4Addr>() {
        Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
    } else if let Ok(ip) = host.parse::<Ipv6Addr>() {
        Ok(SocketAddr::V6(SocketAddrV6::new(ip, port, 0, 0)))
    } else {
        Err(TapNatError::ConfigError(format!(
            "SOCKS5 server must be an IP address, got {:?}",
            host
        )))
    }
}

/// Socket provider that tunnels every link through a SOCKS5 server.
/// Datagram sockets are bound directly; UDP ASSOCIATE is not used.
pub struct Socks5SocketProvider {
    client: Socks5Client,
    connect_timeout: Duration,
    datagrams: DirectSocketProvider,
}

impl Socks5SocketProvider {
    pub fn new(client: Socks5Client) -> Self {
        Self {
            client,
            connect_timeout: Duration::from_secs(10),
            datagrams: DirectSocketProvider::new(),
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn client(&self) -> &Socks5Client {
        &self.client
    }
}

#[async_trait]
impl AsyncSocketProvider for Socks5SocketProvider {
    async fn connect(&self, destination: SocketAddr) -> Result<Arc<dyn LinkSocket>> {
        let stream = tokio::time::timeout(self.connect_timeout, self.client.connect(destination))
            .await
            .map_err(|_| {
                TapNatError::Socks5Error(format!(
                    "tunnel to {} via {} timed out",
                    destination,
                    self.client.proxy_addr()
                ))
            })??;
        log::trace!("SOCKS5 tunnel to {} established", destination);
        Ok(Arc::new(TcpLinkSocket::new(stream)))
    }

    async fn bind_datagram(&self) -> Result<Arc<dyn DatagramSocket>> {
        self.datagrams.bind_datagram().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 server accepting one CONNECT, then echoing payload
    async fn mock_server(require_auth: bool, reply: u8) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();

            let mut head = [0u8; 2];
            stream.read_exact(&mut head).await.unwrap();
            let mut methods = vec![0u8; head[1] as usize];
            stream.read_exact(&mut methods).await.unwrap();

            if require_auth {
                stream.write_all(&[5, 0x02]).await.unwrap();
                let mut ver_ulen = [0u8; 2];
                stream.read_exact(&mut ver_ulen).await.unwrap();
                let mut user = vec![0u8; ver_ulen[1] as usize];
                stream.read_exact(&mut user).await.unwrap();
                let mut plen = [0u8; 1];
                stream.read_exact(&mut plen).await.unwrap();
                let mut pass = vec![0u8; plen[0] as usize];
                stream.read_exact(&mut pass).await.unwrap();
                let ok = user == b"user" && pass == b"pass";
                stream.write_all(&[1, if ok { 0 } else { 1 }]).await.unwrap();
                if !ok {
                    return;
                }
            } else {
                stream.write_all(&[5, 0x00]).await.unwrap();
            }

            // VER CMD RSV ATYP(IPv4) ADDR PORT
            let mut request = [0u8; 10];
            stream.read_exact(&mut request).await.unwrap();
            assert_eq!(request[1], CMD_CONNECT);
            stream
                .write_all(&[5, reply, 0, ATYP_IPV4, 127, 0, 0, 1, 0x1F, 0x90])
                .await
                .unwrap();

            let mut buf = [0u8; 64];
            while let Ok(n) = stream.read(&mut buf).await {
                if n == 0 || stream.write_all(&buf[..n]).await.is_err() {
                    break;
                }
            }
        });
        addr
    }

    fn target() -> SocketAddr {
        "93.184.216.34:80".parse().unwrap()
    }

    #[test]
    fn test_auth_method_from() {
        assert_eq!(AuthMethod::from(0x00), AuthMethod::NoAuth);
        assert_eq!(AuthMethod::from(0x02), AuthMethod::UsernamePassword);
        assert_eq!(AuthMethod::from(0x99), AuthMethod::NoAcceptable);
    }

    #[test]
    fn test_reply_code_display() {
        assert_eq!(ReplyCode::from(0x05), ReplyCode::ConnectionRefused);
        assert_eq!(ReplyCode::from(0x42), ReplyCode::GeneralFailure);
        assert_eq!(ReplyCode::HostUnreachable.to_string(), "host unreachable");
    }

    #[test]
    fn test_put_address() {
        let mut buf = BytesMut::new();
        put_address(&mut buf, "127.0.0.1:8080".parse().unwrap());
        assert_eq!(&buf[..], &[ATYP_IPV4, 127, 0, 0, 1, 0x1F, 0x90]);

        let mut buf = BytesMut::new();
        put_address(&mut buf, "[::1]:443".parse().unwrap());
        assert_eq!(buf[0], ATYP_IPV6);
        assert_eq!(buf.len(), 1 + 16 + 2);
    }

    #[test]
    fn test_credentials_length_limits() {
        assert!(Credentials::new("user", "pass").is_ok());
        assert!(Credentials::new("", "pass").is_err());
        assert!(Credentials::new("u".repeat(256), "pass").is_err());
    }

    #[test]
    fn test_proxy_endpoint() {
        assert_eq!(
            proxy_endpoint("127.0.0.1", 1080).unwrap(),
            "127.0.0.1:1080".parse::<SocketAddr>().unwrap()
        );
        assert!(proxy_endpoint("::1", 1080).unwrap().is_ipv6());
        assert!(proxy_endpoint("localhost", 1080).is_err());
    }

    #[tokio::test]
    async fn test_provider_tunnels_payload() {
        let proxy = mock_server(false, 0x00).await;
        let provider = Socks5SocketProvider::new(Socks5Client::new(proxy));

        let socket = provider.connect(target()).await.unwrap();
        socket.send(b"through the tunnel").await.unwrap();
        let mut buf = [0u8; 64];
        let n = socket.receive(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"through the tunnel");
    }

    #[tokio::test]
    async fn test_username_password_auth() {
        let proxy = mock_server(true, 0x00).await;
        let client = Socks5Client::new(proxy)
            .with_credentials(Credentials::new("user", "pass").unwrap());
        assert!(client.connect(target()).await.is_ok());
    }

    #[tokio::test]
    async fn test_auth_rejected() {
        let proxy = mock_server(true, 0x00).await;
        let client = Socks5Client::new(proxy)
            .with_credentials(Credentials::new("user", "wrong").unwrap());
        let err = client.connect(target()).await.unwrap_err();
        assert!(matches!(err, TapNatError::Socks5Error(_)));
    }

    #[tokio::test]
    async fn test_connect_refused_reply() {
        let proxy = mock_server(false, 0x05).await;
        let err = Socks5Client::new(proxy).connect(target()).await.unwrap_err();
        match err {
            TapNatError::Socks5Error(message) => assert!(message.contains("connection refused")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
