//! Connection endpoints - Unix domain sockets and TCP.
//!
//! The gateway talks to a component over either a Unix socket (default) or
//! TCP. Addresses are written as `unix:///path/to.sock`, `tcp://host:port`,
//! a bare path, or a bare `host:port`.

use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::{TcpListener, TcpStream};
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};
use tracing::debug;

use crate::error::{CallmeshError, Result};

/// Read half of a split connection.
pub type BoxedReader = Box<dyn AsyncRead + Unpin + Send>;

/// Write half of a split connection.
pub type BoxedWriter = Box<dyn AsyncWrite + Unpin + Send>;

/// Where to listen or connect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Address {
    Unix(PathBuf),
    Tcp(String),
}

impl Address {
    /// Parse an address string.
    pub fn parse(address: &str) -> Result<Self> {
        let address = address.trim();
        if address.is_empty() {
            return Err(CallmeshError::Config("Empty address".to_string()));
        }
        if let Some(path) = address.strip_prefix("unix://") {
            return Ok(Address::Unix(PathBuf::from(path)));
        }
        if let Some(host) = address.strip_prefix("tcp://") {
            return Ok(Address::Tcp(host.to_string()));
        }
        if address.starts_with('/') || address.starts_with('.') {
            return Ok(Address::Unix(PathBuf::from(address)));
        }
        if address.contains(':') {
            return Ok(Address::Tcp(address.to_string()));
        }
        Err(CallmeshError::Config(format!(
            "Cannot tell socket kind of address \"{}\"",
            address
        )))
    }

    /// Default socket path for a component.
    pub fn default_socket(component: &str, name: &str, version: &str) -> Self {
        let slug = |s: &str| {
            s.chars()
                .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
                .collect::<String>()
        };
        Address::Unix(std::env::temp_dir().join(format!(
            "callmesh-{}-{}-{}.sock",
            slug(component),
            slug(name),
            slug(version)
        )))
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Unix(path) => write!(f, "unix://{}", path.display()),
            Address::Tcp(host) => write!(f, "tcp://{}", host),
        }
    }
}

/// Listening endpoint.
pub enum Listener {
    #[cfg(unix)]
    Unix { listener: UnixListener, path: PathBuf },
    Tcp(TcpListener),
}

impl Listener {
    /// Bind to an address. A stale Unix socket file is removed first.
    pub async fn bind(address: &Address) -> Result<Self> {
        match address {
            #[cfg(unix)]
            Address::Unix(path) => {
                if Path::new(path).exists() {
                    std::fs::remove_file(path)?;
                }
                let listener = UnixListener::bind(path)?;
                Ok(Listener::Unix {
                    listener,
                    path: path.clone(),
                })
            }
            #[cfg(not(unix))]
            Address::Unix(path) => Err(CallmeshError::Config(format!(
                "Unix sockets are unavailable on this platform: {}",
                path.display()
            ))),
            Address::Tcp(host) => Ok(Listener::Tcp(TcpListener::bind(host.as_str()).await?)),
        }
    }

    /// Wait for the next connection.
    pub async fn accept(&self) -> Result<Connection> {
        match self {
            #[cfg(unix)]
            Listener::Unix { listener, .. } => {
                let (stream, _addr) = listener.accept().await?;
                Ok(Connection::Unix(stream))
            }
            Listener::Tcp(listener) => {
                let (stream, peer) = listener.accept().await?;
                debug!(%peer, "Accepted TCP connection");
                stream.set_nodelay(true)?;
                Ok(Connection::Tcp(stream))
            }
        }
    }

    /// Actual bound address (resolves port 0).
    pub fn local_addr(&self) -> Result<Address> {
        match self {
            #[cfg(unix)]
            Listener::Unix { path, .. } => Ok(Address::Unix(path.clone())),
            Listener::Tcp(listener) => Ok(Address::Tcp(listener.local_addr()?.to_string())),
        }
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix { path, .. } = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Connect to an address.
///
/// # Errors
///
/// `TransportWrite` when the endpoint is unreachable.
pub async fn connect(address: &Address) -> Result<Connection> {
    let unreachable = |e: std::io::Error| {
        CallmeshError::TransportWrite(format!("Cannot connect to {}: {}", address, e))
    };
    match address {
        #[cfg(unix)]
        Address::Unix(path) => Ok(Connection::Unix(
            UnixStream::connect(path).await.map_err(unreachable)?,
        )),
        #[cfg(not(unix))]
        Address::Unix(_) => Err(CallmeshError::Config(
            "Unix sockets are unavailable on this platform".to_string(),
        )),
        Address::Tcp(host) => {
            let stream = TcpStream::connect(host.as_str()).await.map_err(unreachable)?;
            stream.set_nodelay(true)?;
            Ok(Connection::Tcp(stream))
        }
    }
}

/// An established connection.
pub enum Connection {
    #[cfg(unix)]
    Unix(UnixStream),
    Tcp(TcpStream),
}

impl Connection {
    /// Split into owned halves for a reader loop and a writer task.
    pub fn into_split(self) -> (BoxedReader, BoxedWriter) {
        match self {
            #[cfg(unix)]
            Connection::Unix(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
            Connection::Tcp(stream) => {
                let (r, w) = stream.into_split();
                (Box::new(r), Box::new(w))
            }
        }
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_read(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_write(cx, buf),
            Connection::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_flush(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            #[cfg(unix)]
            Connection::Unix(stream) => Pin::new(stream).poll_shutdown(cx),
            Connection::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[test]
    fn test_parse_addresses() {
        assert_eq!(
            Address::parse("unix:///tmp/a.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/a.sock"))
        );
        assert_eq!(
            Address::parse("/tmp/b.sock").unwrap(),
            Address::Unix(PathBuf::from("/tmp/b.sock"))
        );
        assert_eq!(
            Address::parse("tcp://127.0.0.1:5010").unwrap(),
            Address::Tcp("127.0.0.1:5010".into())
        );
        assert_eq!(
            Address::parse("localhost:80").unwrap(),
            Address::Tcp("localhost:80".into())
        );
        assert!(Address::parse("").is_err());
        assert!(Address::parse("nothing").is_err());
    }

    #[test]
    fn test_default_socket_is_sanitized() {
        let Address::Unix(path) = Address::default_socket("service", "users", "1.0.*") else {
            panic!("expected unix address");
        };
        let name = path.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name, "callmesh-service-users-1-0--.sock");
    }

    #[tokio::test]
    async fn test_tcp_roundtrip() {
        let listener = Listener::bind(&Address::Tcp("127.0.0.1:0".into())).await.unwrap();
        let address = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut conn = listener.accept().await.unwrap();
            let mut buf = [0u8; 5];
            conn.read_exact(&mut buf).await.unwrap();
            conn.write_all(&buf).await.unwrap();
        });

        let mut client = connect(&address).await.unwrap();
        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");
        server.await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_unix_bind_removes_stale_socket() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stale.sock");
        std::fs::write(&path, b"").unwrap();

        let listener = Listener::bind(&Address::Unix(path.clone())).await.unwrap();
        assert!(path.exists());
        drop(listener);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_connect_unreachable() {
        let listener = Listener::bind(&Address::Tcp("127.0.0.1:0".into())).await.unwrap();
        let address = listener.local_addr().unwrap();
        drop(listener);
        assert!(matches!(
            connect(&address).await,
            Err(CallmeshError::TransportWrite(_))
        ));
    }
}
