//! TCP and Unix-socket transports.
//!
//! Both flavours run the same per-connection machinery: the stream is split,
//! a writer task drains the link's outbound queue through
//! [`write_message`], and a reader loop turns framed messages into
//! [`TransportEvent`]s until the peer goes away or the session lets go.

use std::io;
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream, UnixListener, UnixStream};
use tracing::{debug, warn};

use crate::config::Endpoint;
use crate::transport::framing::{read_message, write_message};
use crate::transport::{Link, Transport, TransportEvent, Wire};

/// Any byte stream the framing layer can run over.
trait Duplex: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> Duplex for T {}

type BoxedStream = Box<dyn Duplex>;

/// Dials the endpoint passed to [`Transport::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamConnector;

impl StreamConnector {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for StreamConnector {
    fn open(&self, endpoint: &Endpoint) -> Link {
        let (link, wire) = Link::pair();
        let endpoint = endpoint.clone();

        tokio::spawn(async move {
            match connect(&endpoint).await {
                Ok(stream) => {
                    debug!("Connected to {}", endpoint);
                    if wire.emit(TransportEvent::Open) {
                        serve_stream(stream, wire).await;
                    }
                }
                Err(e) => {
                    debug!("Connection to {} failed: {:#}", endpoint, e);
                    wire.emit(TransportEvent::Error(format!("{:#}", e)));
                }
            }
        });

        link
    }
}

async fn connect(endpoint: &Endpoint) -> Result<BoxedStream> {
    match endpoint {
        Endpoint::Tcp { .. } => {
            let addr = endpoint.socket_addr().unwrap_or_default();
            let stream = TcpStream::connect(&addr)
                .await
                .with_context(|| format!("Failed to connect to {}", endpoint))?;
            stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
            Ok(Box::new(stream))
        }
        Endpoint::Unix(path) => {
            let stream = UnixStream::connect(path)
                .await
                .with_context(|| format!("Failed to connect to {}", endpoint))?;
            Ok(Box::new(stream))
        }
    }
}

enum Listener {
    Tcp(TcpListener),
    Unix(UnixListener, PathBuf),
}

/// Listens on a fixed endpoint; each [`Transport::open`] waits for the next
/// peer to connect.
///
/// This is the control-process side: the embedded host dials in, and after
/// a drop the session simply waits for it to dial in again. The endpoint
/// passed to `open` is ignored in favour of the bound one. Clones share the
/// listener, so several sessions can each wait for their own peer.
#[derive(Clone)]
pub struct StreamAcceptor {
    listener: Arc<Listener>,
    local: Endpoint,
}

impl StreamAcceptor {
    /// Bind the endpoint.
    ///
    /// Fails with [`io::ErrorKind::AddrInUse`] when another process is
    /// already serving it. A leftover Unix socket file with nobody behind it
    /// is replaced. Binding TCP port 0 picks a free port; see
    /// [`local_endpoint`](Self::local_endpoint).
    pub async fn bind(endpoint: &Endpoint) -> io::Result<Self> {
        match endpoint {
            Endpoint::Tcp { host, .. } => {
                let addr = endpoint.socket_addr().unwrap_or_default();
                let listener = TcpListener::bind(&addr).await?;
                let port = listener.local_addr()?.port();
                Ok(Self {
                    listener: Arc::new(Listener::Tcp(listener)),
                    local: Endpoint::Tcp {
                        host: host.clone(),
                        port,
                    },
                })
            }
            Endpoint::Unix(path) => {
                remove_stale_socket(path).await?;
                let listener = UnixListener::bind(path)?;
                Ok(Self {
                    listener: Arc::new(Listener::Unix(listener, path.clone())),
                    local: endpoint.clone(),
                })
            }
        }
    }

    /// The endpoint actually bound.
    pub fn local_endpoint(&self) -> &Endpoint {
        &self.local
    }
}

impl Transport for StreamAcceptor {
    fn open(&self, _endpoint: &Endpoint) -> Link {
        let (link, wire) = Link::pair();
        let listener = Arc::clone(&self.listener);
        let local = self.local.clone();

        tokio::spawn(async move {
            let accepted = tokio::select! {
                _ = wire.events.closed() => return,
                accepted = accept(&listener) => accepted,
            };
            // Only the acceptor handles keep the socket file alive
            drop(listener);

            match accepted {
                Ok(stream) => {
                    debug!("Accepted peer on {}", local);
                    if wire.emit(TransportEvent::Open) {
                        serve_stream(stream, wire).await;
                    }
                }
                Err(e) => {
                    warn!("Accept on {} failed: {:#}", local, e);
                    wire.emit(TransportEvent::Error(format!("{:#}", e)));
                }
            }
        });

        link
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Listener::Unix(_, path) = self {
            let _ = std::fs::remove_file(path);
        }
    }
}

async fn accept(listener: &Listener) -> Result<BoxedStream> {
    match listener {
        Listener::Tcp(listener) => {
            let (stream, peer) = listener.accept().await.context("Failed to accept")?;
            stream.set_nodelay(true).context("Failed to set TCP_NODELAY")?;
            debug!("TCP peer {}", peer);
            Ok(Box::new(stream))
        }
        Listener::Unix(listener, _) => {
            let (stream, _) = listener.accept().await.context("Failed to accept")?;
            Ok(Box::new(stream))
        }
    }
}

/// Remove a Unix socket file left behind by a dead process.
///
/// Anything at `path` that is not a socket is left alone and reported as
/// [`io::ErrorKind::AlreadyExists`].
async fn remove_stale_socket(path: &Path) -> io::Result<()> {
    let metadata = match std::fs::symlink_metadata(path) {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };
    if !metadata.file_type().is_socket() {
        return Err(io::Error::new(
            io::ErrorKind::AlreadyExists,
            format!("{} exists and is not a socket", path.display()),
        ));
    }

    match UnixStream::connect(path).await {
        Ok(_) => Err(io::Error::new(
            io::ErrorKind::AddrInUse,
            format!("{} is already being served", path.display()),
        )),
        Err(_) => {
            debug!("Removing stale socket {}", path.display());
            std::fs::remove_file(path)
        }
    }
}

/// Pump one established connection until either side is done.
async fn serve_stream(stream: BoxedStream, wire: Wire) {
    let Wire {
        outbound: mut outbound_rx,
        events,
    } = wire;

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = BufReader::new(read_half);

    let writer_events = events.clone();
    let writer = tokio::spawn(async move {
        while let Some(body) = outbound_rx.recv().await {
            if let Err(e) = write_message(&mut write_half, &body).await {
                let _ = writer_events.send(TransportEvent::Error(format!("{:#}", e)));
                return;
            }
        }
        let _ = write_half.shutdown().await;
    });

    loop {
        let result = tokio::select! {
            _ = events.closed() => break,
            result = read_message(&mut reader) => result,
        };

        match result {
            Ok(Some(body)) => {
                if events.send(TransportEvent::Message(body)).is_err() {
                    break;
                }
            }
            Ok(None) => {
                let _ = events.send(TransportEvent::Closed(
                    "peer closed the connection".to_string(),
                ));
                break;
            }
            Err(e) => {
                let _ = events.send(TransportEvent::Error(format!("{:#}", e)));
                break;
            }
        }
    }

    // The session drops its sender once it sees a terminal event; until then
    // the writer may still be flushing responses.
    if events.is_closed() {
        writer.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::AsyncReadExt;
    use tokio::time::timeout;

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    fn localhost_any_port() -> Endpoint {
        Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn test_connector_reports_refused_connection() {
        // Bind then drop to get a port nobody listens on
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            listener.local_addr().unwrap().port()
        };
        let endpoint = Endpoint::Tcp {
            host: "127.0.0.1".to_string(),
            port,
        };

        let mut link = StreamConnector::new().open(&endpoint);
        let event = timeout(TEST_TIMEOUT, link.next_event()).await.unwrap();
        assert!(matches!(event, TransportEvent::Error(_)), "got {:?}", event);
    }

    #[tokio::test]
    async fn test_acceptor_and_connector_exchange_messages() {
        let acceptor = StreamAcceptor::bind(&localhost_any_port()).await.unwrap();
        let endpoint = acceptor.local_endpoint().clone();

        let mut server = acceptor.open(&endpoint);
        let mut client = StreamConnector::new().open(&endpoint);

        assert_eq!(
            timeout(TEST_TIMEOUT, client.next_event()).await.unwrap(),
            TransportEvent::Open
        );
        assert_eq!(
            timeout(TEST_TIMEOUT, server.next_event()).await.unwrap(),
            TransportEvent::Open
        );

        client.sender().send(b"to server".to_vec()).unwrap();
        assert_eq!(
            timeout(TEST_TIMEOUT, server.next_event()).await.unwrap(),
            TransportEvent::Message(b"to server".to_vec())
        );

        server.sender().send(b"to client".to_vec()).unwrap();
        assert_eq!(
            timeout(TEST_TIMEOUT, client.next_event()).await.unwrap(),
            TransportEvent::Message(b"to client".to_vec())
        );

        // Dropping the client link closes its socket
        drop(client);
        let event = timeout(TEST_TIMEOUT, server.next_event()).await.unwrap();
        assert!(event.is_terminal(), "got {:?}", event);
    }

    #[tokio::test]
    async fn test_unix_socket_frames_reach_raw_peer() {
        let dir = std::env::temp_dir().join(format!("scriptbridge-test-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stream.sock");
        let endpoint = Endpoint::Unix(path.clone());

        let acceptor = StreamAcceptor::bind(&endpoint).await.unwrap();
        let mut server = acceptor.open(&endpoint);

        let mut raw = UnixStream::connect(&path).await.unwrap();
        assert_eq!(
            timeout(TEST_TIMEOUT, server.next_event()).await.unwrap(),
            TransportEvent::Open
        );

        server.sender().send(b"{}".to_vec()).unwrap();
        let mut buf = vec![0u8; 23];
        timeout(TEST_TIMEOUT, raw.read_exact(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf, b"Content-Length: 2\r\n\r\n{}");

        drop(acceptor);
        assert!(!path.exists());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_bind_refuses_live_unix_socket() {
        let dir = std::env::temp_dir().join(format!("scriptbridge-live-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let endpoint = Endpoint::Unix(dir.join("live.sock"));

        let first = StreamAcceptor::bind(&endpoint).await.unwrap();
        let second = StreamAcceptor::bind(&endpoint).await;
        assert_eq!(second.err().map(|e| e.kind()), Some(io::ErrorKind::AddrInUse));

        drop(first);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_bind_leaves_regular_files_alone() {
        let dir = std::env::temp_dir().join(format!("scriptbridge-file-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("important.txt");
        std::fs::write(&path, "user data").unwrap();

        let result = StreamAcceptor::bind(&Endpoint::Unix(path.clone())).await;
        assert_eq!(
            result.err().map(|e| e.kind()),
            Some(io::ErrorKind::AlreadyExists)
        );
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "user data");

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn test_bind_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("scriptbridge-stale-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("stale.sock");

        // A std listener leaves its socket file behind when dropped
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        assert!(path.exists());

        let acceptor = StreamAcceptor::bind(&Endpoint::Unix(path.clone())).await;
        assert!(acceptor.is_ok());

        drop(acceptor);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
