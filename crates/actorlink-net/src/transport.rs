//! Stream transports: TCP and Unix domain sockets
//!
//! Addresses are written `tcp://host:port` or `uds:///path/to/socket`.
//! Both transports are split into boxed halves so everything above this
//! module handles them the same way.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

/// Transport parse errors
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("transport string cannot be empty")]
    Empty,
    #[error("transport must be in format 'protocol://address', got {0:?}")]
    MissingProtocol(String),
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("invalid TCP address {0:?}: expected HOST:PORT")]
    InvalidTcpAddress(String),
    #[error("path to UDS socket cannot be a directory: {0:?}")]
    UdsDirectory(String),
}

/// Where a node listens or a peer is reached
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Transport {
    /// `host:port`, resolved on every connect
    Tcp(String),
    Uds(PathBuf),
}

impl Transport {
    /// TCP transport from a bare `host:port`
    pub fn tcp(addr: &str) -> Result<Self, TransportError> {
        match addr.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Ok(Self::Tcp(addr.to_string()))
            }
            _ => Err(TransportError::InvalidTcpAddress(addr.to_string())),
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, Self::Tcp(_))
    }

    pub fn is_uds(&self) -> bool {
        matches!(self, Self::Uds(_))
    }
}

impl FromStr for Transport {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(TransportError::Empty);
        }

        let (protocol, address) = match trimmed.split_once("://") {
            Some((protocol, address)) if !protocol.is_empty() && !address.is_empty() => {
                (protocol, address)
            }
            _ => return Err(TransportError::MissingProtocol(trimmed.to_string())),
        };

        match protocol {
            "tcp" => Self::tcp(address),
            "uds" => {
                if address.ends_with('/') {
                    return Err(TransportError::UdsDirectory(address.to_string()));
                }
                Ok(Self::Uds(PathBuf::from(address)))
            }
            other => Err(TransportError::UnknownProtocol(other.to_string())),
        }
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp(addr) => write!(f, "tcp://{addr}"),
            Self::Uds(path) => write!(f, "uds://{}", path.display()),
        }
    }
}

impl From<SocketAddr> for Transport {
    fn from(addr: SocketAddr) -> Self {
        Self::Tcp(addr.to_string())
    }
}

// =============================================================================
// STREAMS
// =============================================================================

pub(crate) type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An open stream, split
pub(crate) struct Stream {
    pub(crate) reader: BoxedReader,
    pub(crate) writer: BoxedWriter,
    /// Remote socket address, TCP only
    pub(crate) remote: Option<SocketAddr>,
}

impl Stream {
    fn tcp(stream: TcpStream) -> Self {
        if let Err(err) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", err);
        }
        let remote = stream.peer_addr().ok();
        let (read, write) = stream.into_split();
        Self {
            reader: Box::new(read),
            writer: Box::new(write),
            remote,
        }
    }

    #[cfg(unix)]
    fn uds(stream: UnixStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: Box::new(read),
            writer: Box::new(write),
            remote: None,
        }
    }
}

#[cfg(not(unix))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "unix domain sockets are not supported on this platform",
    )
}

/// Open a stream to `transport`
pub(crate) async fn connect(transport: &Transport) -> io::Result<Stream> {
    match transport {
        Transport::Tcp(addr) => Ok(Stream::tcp(TcpStream::connect(addr.as_str()).await?)),
        #[cfg(unix)]
        Transport::Uds(path) => Ok(Stream::uds(UnixStream::connect(path).await?)),
        #[cfg(not(unix))]
        Transport::Uds(_) => Err(unsupported()),
    }
}

// =============================================================================
// LISTENER
// =============================================================================

/// Bound listener for either transport
pub(crate) enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Uds(UdsListener),
}

/// Unix listener that removes its socket file when dropped
#[cfg(unix)]
pub(crate) struct UdsListener {
    listener: UnixListener,
    path: PathBuf,
}

#[cfg(unix)]
impl Drop for UdsListener {
    fn drop(&mut self) {
        if let Err(err) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove socket {}: {}", self.path.display(), err);
        }
    }
}

impl Listener {
    pub(crate) async fn bind(transport: &Transport) -> io::Result<Self> {
        match transport {
            Transport::Tcp(addr) => Ok(Self::Tcp(TcpListener::bind(addr.as_str()).await?)),
            #[cfg(unix)]
            Transport::Uds(path) => Ok(Self::Uds(UdsListener {
                listener: UnixListener::bind(path)?,
                path: path.clone(),
            })),
            #[cfg(not(unix))]
            Transport::Uds(_) => Err(unsupported()),
        }
    }

    /// Bound address, with the TCP port resolved
    pub(crate) fn local_addr(&self) -> io::Result<Transport> {
        match self {
            Self::Tcp(listener) => Ok(listener.local_addr()?.into()),
            #[cfg(unix)]
            Self::Uds(uds) => Ok(Transport::Uds(uds.path.clone())),
        }
    }

    /// Next inbound stream and a description of its origin for logs
    pub(crate) async fn accept(&self) -> io::Result<(Stream, String)> {
        match self {
            Self::Tcp(listener) => {
                let (stream, remote) = listener.accept().await?;
                Ok((Stream::tcp(stream), remote.to_string()))
            }
            #[cfg(unix)]
            Self::Uds(uds) => {
                let (stream, _) = uds.listener.accept().await?;
                Ok((Stream::uds(stream), format!("uds://{}", uds.path.display())))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[test]
    fn test_rejects_empty() {
        for s in ["", "   ", "\t", "\n", " \t\n "] {
            assert_eq!(s.parse::<Transport>(), Err(TransportError::Empty));
        }
    }

    #[test]
    fn test_rejects_missing_protocol() {
        for s in ["://a/b", "tcp127.0.0.1:4242", "tcp://"] {
            assert!(matches!(
                s.parse::<Transport>(),
                Err(TransportError::MissingProtocol(_))
            ));
        }
    }

    #[test]
    fn test_rejects_unknown_protocol() {
        assert_eq!(
            "foo://a".parse::<Transport>(),
            Err(TransportError::UnknownProtocol("foo".into()))
        );
    }

    #[test]
    fn test_rejects_uds_directory() {
        assert_eq!(
            "uds:///tmp/".parse::<Transport>(),
            Err(TransportError::UdsDirectory("/tmp/".into()))
        );
    }

    #[test]
    fn test_parses_tcp() {
        for s in ["tcp://127.0.0.1:4242", "tcp://localhost:8080", "tcp://0.0.0.0:9000"] {
            let transport: Transport = s.parse().unwrap();
            assert!(transport.is_tcp());
            assert!(!transport.is_uds());
            assert_eq!(transport.to_string(), s);
        }
        assert!(matches!(
            "tcp://localhost".parse::<Transport>(),
            Err(TransportError::InvalidTcpAddress(_))
        ));
    }

    #[test]
    fn test_parses_uds() {
        for s in ["uds:///tmp/socket", "uds://rel/socket", "uds:///var/run/app.sock"] {
            let transport: Transport = s.parse().unwrap();
            assert!(transport.is_uds());
            assert!(!transport.is_tcp());
            assert_eq!(transport.to_string(), s);
        }
    }

    #[test]
    fn test_trims_whitespace() {
        assert_eq!(
            " tcp://127.0.0.1:4242".parse::<Transport>().unwrap(),
            Transport::Tcp("127.0.0.1:4242".into())
        );
        assert_eq!(
            "tcp://127.0.0.1:4242 ".parse::<Transport>().unwrap(),
            Transport::Tcp("127.0.0.1:4242".into())
        );
        assert_eq!(
            "  uds:///tmp/socket  ".parse::<Transport>().unwrap(),
            Transport::Uds("/tmp/socket".into())
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_uds_listener_connect_and_cleanup() {
        let path = std::env::temp_dir().join(format!(
            "actorlink-transport-{}-{}.sock",
            std::process::id(),
            rand::random::<u32>()
        ));
        let transport = Transport::Uds(path.clone());

        let listener = Listener::bind(&transport).await.unwrap();
        assert_eq!(listener.local_addr().unwrap(), transport);

        let client = tokio::spawn({
            let transport = transport.clone();
            async move {
                let mut stream = connect(&transport).await.unwrap();
                stream.writer.write_all(b"ping").await.unwrap();
                stream.writer.flush().await.unwrap();
            }
        });

        let (mut stream, origin) = listener.accept().await.unwrap();
        assert!(stream.remote.is_none());
        assert!(origin.starts_with("uds://"));
        let mut buf = [0u8; 4];
        stream.reader.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
        client.await.unwrap();

        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_tcp_local_addr_resolves_port() {
        let listener = Listener::bind(&"tcp://127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        match listener.local_addr().unwrap() {
            Transport::Tcp(addr) => assert!(!addr.ends_with(":0")),
            other => panic!("unexpected transport {other}"),
        }
    }
}
