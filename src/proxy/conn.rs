//! Dial targets and raw TCP passthrough.
//!
//! # Responsibilities
//! - Describe one (protocol, host, port) dial target of a backend
//! - Dial the backend and relay bytes in both directions
//! - End the relay once either side closes, after a bounded linger
//! - Surface byte-count mismatches as integrity errors

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time;

use crate::discovery::backend::{Backend, Protocol};
use crate::net::listener::ListenerKey;

const RELAY_BUFFER: usize = 8192;

/// How long the surviving direction may keep flowing after the other ends.
pub const RELAY_LINGER: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to dial {address}: {source}")]
    Dial {
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("dialing {address} timed out after {timeout:?}")]
    DialTimeout { address: String, timeout: Duration },

    #[error("relay error: {0}")]
    Io(#[from] io::Error),

    #[error(
        "byte counts diverged: client read {}, upstream written {}, upstream read {}, client written {}",
        .0.client_read, .0.upstream_written, .0.upstream_read, .0.client_written
    )]
    Integrity(RelayStats),
}

/// Byte counters for both directions of a relay.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayStats {
    pub client_read: u64,
    pub upstream_written: u64,
    pub upstream_read: u64,
    pub client_written: u64,
}

impl RelayStats {
    /// Every byte read on one side was written to the other.
    pub fn is_balanced(&self) -> bool {
        self.client_read == self.upstream_written && self.upstream_read == self.client_written
    }
}

/// One dial target derived from a backend's declared port.
#[derive(Debug, Clone)]
pub struct Conn {
    protocol: Protocol,
    host: String,
    port: u16,
    backend: Arc<Backend>,
}

impl Conn {
    pub fn new(protocol: Protocol, host: &str, port: u16, backend: Arc<Backend>) -> Self {
        Self {
            protocol,
            host: host.to_lowercase(),
            port,
            backend,
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    /// `host:port` to dial.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// The listener this target needs on the proxy side.
    pub fn listener_key(&self) -> ListenerKey {
        ListenerKey::new(self.protocol.clone(), self.port)
    }

    /// Dial the backend and relay `client` through it until either side closes.
    pub async fn pass(
        &self,
        mut client: TcpStream,
        connect_timeout: Duration,
    ) -> Result<RelayStats, RelayError> {
        let address = self.address();
        let mut upstream = match time::timeout(connect_timeout, TcpStream::connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => return Err(RelayError::Dial { address, source }),
            Err(_) => {
                return Err(RelayError::DialTimeout {
                    address,
                    timeout: connect_timeout,
                })
            }
        };

        tracing::debug!(conn = %self, "Connected to backend");
        relay(&mut client, &mut upstream, RELAY_LINGER).await
    }
}

impl fmt::Display for Conn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}:{}", self.protocol, self.host, self.port)
    }
}

#[derive(Default)]
struct Transfer {
    read: u64,
    written: u64,
    error: Option<io::Error>,
}

async fn pump<R, W>(reader: &mut R, writer: &mut W, transfer: &mut Transfer)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; RELAY_BUFFER];

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                transfer.error = Some(e);
                break;
            }
        };
        transfer.read += n as u64;

        if let Err(e) = writer.write_all(&buf[..n]).await {
            transfer.error = Some(e);
            return;
        }
        transfer.written += n as u64;
    }

    // peer may already be gone
    if let Err(e) = writer.shutdown().await {
        tracing::trace!(error = %e, "Relay half-close failed");
    }
}

enum Direction {
    Upstream,
    Downstream,
}

/// Relay bytes between two streams until either side closes or errors.
///
/// The other direction then gets `linger` to drain before it is dropped.
pub async fn relay<A, B>(
    client: &mut A,
    upstream: &mut B,
    linger: Duration,
) -> Result<RelayStats, RelayError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    let mut outbound = Transfer::default();
    let mut inbound = Transfer::default();

    let drained = {
        let to_upstream = pump(&mut client_read, &mut upstream_write, &mut outbound);
        let to_client = pump(&mut upstream_read, &mut client_write, &mut inbound);
        tokio::pin!(to_upstream, to_client);

        let first = tokio::select! {
            _ = &mut to_upstream => Direction::Upstream,
            _ = &mut to_client => Direction::Downstream,
        };
        match first {
            Direction::Upstream => time::timeout(linger, &mut to_client).await.is_ok(),
            Direction::Downstream => time::timeout(linger, &mut to_upstream).await.is_ok(),
        }
    };
    if !drained {
        tracing::debug!(linger = ?linger, "Peer idle after close, ending relay");
    }

    let stats = RelayStats {
        client_read: outbound.read,
        upstream_written: outbound.written,
        upstream_read: inbound.read,
        client_written: inbound.written,
    };

    if !stats.is_balanced() {
        return Err(RelayError::Integrity(stats));
    }
    if let Some(e) = outbound.error.or(inbound.error) {
        return Err(RelayError::Io(e));
    }
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio::net::TcpListener;

    fn conn(host: &str, port: u16) -> Conn {
        Conn::new(
            Protocol::Tcp,
            host,
            port,
            Arc::new(Backend::new("echo", "default")),
        )
    }

    #[test]
    fn describes_its_target() {
        let c = conn("Echo.Default.svc.cluster.local", 7000);
        assert_eq!(c.address(), "echo.default.svc.cluster.local:7000");
        assert_eq!(c.listener_key().to_string(), "tcp:7000");
        assert_eq!(c.to_string(), "tcp echo.default.svc.cluster.local:7000");
        assert_eq!(c.backend().name, "echo");
    }

    #[tokio::test]
    async fn relays_both_directions() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut upstream, mut upstream_peer) = duplex(64);

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 5];
            upstream_peer.read_exact(&mut buf).await.unwrap();
            upstream_peer.write_all(b"pong!").await.unwrap();
            upstream_peer.shutdown().await.unwrap();
            buf
        });

        let driver = tokio::spawn(async move {
            client_peer.write_all(b"ping!").await.unwrap();
            client_peer.shutdown().await.unwrap();
            let mut reply = Vec::new();
            client_peer.read_to_end(&mut reply).await.unwrap();
            reply
        });

        let stats = relay(&mut client, &mut upstream, RELAY_LINGER).await.unwrap();
        assert_eq!(&echo.await.unwrap(), b"ping!");
        assert_eq!(driver.await.unwrap(), b"pong!");
        assert_eq!(stats.client_read, 5);
        assert_eq!(stats.client_written, 5);
        assert!(stats.is_balanced());
    }

    #[tokio::test]
    async fn lost_bytes_are_an_integrity_error() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut upstream, upstream_peer) = duplex(64);
        drop(upstream_peer);

        client_peer.write_all(b"hello").await.unwrap();
        client_peer.shutdown().await.unwrap();

        match relay(&mut client, &mut upstream, RELAY_LINGER).await {
            Err(RelayError::Integrity(stats)) => {
                assert_eq!(stats.client_read, 5);
                assert_eq!(stats.upstream_written, 0);
            }
            other => panic!("expected integrity error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn upstream_close_ends_relay_with_idle_client() {
        let (mut client, _client_peer) = duplex(64);
        let (mut upstream, upstream_peer) = duplex(64);
        drop(upstream_peer);

        let finished = time::timeout(
            Duration::from_secs(2),
            relay(&mut client, &mut upstream, Duration::from_millis(100)),
        )
        .await
        .expect("relay must end once the upstream has closed");
        let stats = finished.unwrap();
        assert_eq!(stats, RelayStats::default());
    }

    #[tokio::test]
    async fn client_close_ends_relay_with_idle_upstream() {
        let (mut client, mut client_peer) = duplex(64);
        let (mut upstream, mut upstream_peer) = duplex(64);

        client_peer.write_all(b"bye").await.unwrap();
        drop(client_peer);

        let stats = time::timeout(
            Duration::from_secs(2),
            relay(&mut client, &mut upstream, Duration::from_millis(100)),
        )
        .await
        .expect("relay must end once the client has closed")
        .unwrap();
        assert_eq!(stats.upstream_written, 3);

        let mut forwarded = [0u8; 3];
        upstream_peer.read_exact(&mut forwarded).await.unwrap();
        assert_eq!(&forwarded, b"bye");
    }

    #[tokio::test]
    async fn pass_dials_the_backend() {
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = backend.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = backend.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            socket.write_all(&buf).await.unwrap();
        });

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let client = tokio::spawn(async move {
            let mut s = TcpStream::connect(front_addr).await.unwrap();
            s.write_all(b"abcd").await.unwrap();
            let mut buf = [0u8; 4];
            s.read_exact(&mut buf).await.unwrap();
            buf
        });

        let (accepted, _) = front.accept().await.unwrap();
        let stats = conn("127.0.0.1", port)
            .pass(accepted, Duration::from_secs(2))
            .await
            .unwrap();
        assert_eq!(&client.await.unwrap(), b"abcd");
        assert_eq!(stats.upstream_read, 4);
    }

    #[tokio::test]
    async fn pass_reports_dial_failures() {
        let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = closed.local_addr().unwrap().port();
        drop(closed);

        let front = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let front_addr = front.local_addr().unwrap();
        let _client = TcpStream::connect(front_addr).await.unwrap();
        let (accepted, _) = front.accept().await.unwrap();

        let err = conn("127.0.0.1", port)
            .pass(accepted, Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Dial { .. }));
    }
}
