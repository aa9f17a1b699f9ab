//! Runtime-managed TCP listeners.
//!
//! # Responsibilities
//! - Own one OS socket per (protocol, port) pair
//! - Run an accept loop feeding the shared request channel
//! - Track lifecycle state (Ready → Listening → Closed)
//!
//! # Design Decisions
//! - The request channel is bounded; a slow dispatch loop stalls accepts
//! - Close is cancel + acknowledge, bounded by a timeout
//! - A listener is marked Closed even when its loop fails to acknowledge,
//!   so a second close never re-enters

use std::fmt;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::discovery::backend::Protocol;
use crate::net::connection::ConnectionRequest;

/// How long `close` waits for the accept loop by default.
pub const DEFAULT_CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause after an accept error so a persistent failure does not spin.
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Identity of a listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerKey {
    pub protocol: Protocol,
    pub port: u16,
}

impl ListenerKey {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self { protocol, port }
    }
}

impl fmt::Display for ListenerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.protocol, self.port)
    }
}

/// Lifecycle state. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Ready,
    Listening,
    Closed,
}

#[derive(Debug, Error)]
pub enum ListenerError {
    #[error("listener {0} is already running")]
    AlreadyListening(ListenerKey),

    #[error("listener {0} is closed")]
    Closed(ListenerKey),

    #[error("cannot listen on protocol {0}")]
    UnsupportedProtocol(Protocol),

    #[error("failed to bind {key}: {source}")]
    Bind {
        key: ListenerKey,
        #[source]
        source: io::Error,
    },

    #[error("listener {key} did not stop within {timeout:?}")]
    CloseTimeout { key: ListenerKey, timeout: Duration },
}

/// A bound socket plus its accept loop.
#[derive(Debug)]
pub struct Listener {
    key: ListenerKey,
    bind_ip: IpAddr,
    status: ListenerStatus,
    local_addr: Option<SocketAddr>,
    requests: mpsc::Sender<ConnectionRequest>,
    cancel: CancellationToken,
    done: Option<oneshot::Receiver<()>>,
}

impl Listener {
    /// Create a listener in the Ready state. Nothing is bound yet.
    ///
    /// `cancel` should be derived from the process shutdown token.
    pub fn new(
        key: ListenerKey,
        bind_ip: IpAddr,
        requests: mpsc::Sender<ConnectionRequest>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            key,
            bind_ip,
            status: ListenerStatus::Ready,
            local_addr: None,
            requests,
            cancel,
            done: None,
        }
    }

    /// Bind the socket and start accepting.
    pub async fn listen(&mut self) -> Result<(), ListenerError> {
        match self.status {
            ListenerStatus::Listening => {
                return Err(ListenerError::AlreadyListening(self.key.clone()))
            }
            ListenerStatus::Closed => return Err(ListenerError::Closed(self.key.clone())),
            ListenerStatus::Ready => {}
        }

        if self.key.protocol != Protocol::Tcp {
            return Err(ListenerError::UnsupportedProtocol(self.key.protocol.clone()));
        }

        let socket = TcpListener::bind((self.bind_ip, self.key.port))
            .await
            .map_err(|source| ListenerError::Bind {
                key: self.key.clone(),
                source,
            })?;
        let local_addr = socket.local_addr().map_err(|source| ListenerError::Bind {
            key: self.key.clone(),
            source,
        })?;

        let (done_tx, done_rx) = oneshot::channel();
        tokio::spawn(accept_loop(
            self.key.clone(),
            socket,
            self.requests.clone(),
            self.cancel.clone(),
            done_tx,
        ));

        self.local_addr = Some(local_addr);
        self.done = Some(done_rx);
        self.status = ListenerStatus::Listening;

        tracing::info!(listener = %self.key, address = %local_addr, "Listener bound");
        Ok(())
    }

    /// Stop the accept loop and release the socket.
    pub async fn close(&mut self, timeout: Duration) -> Result<(), ListenerError> {
        if self.status == ListenerStatus::Closed {
            return Ok(());
        }

        self.cancel.cancel();
        self.status = ListenerStatus::Closed;
        self.local_addr = None;

        let Some(done) = self.done.take() else {
            return Ok(());
        };

        // a dropped sender also means the loop has exited
        if time::timeout(timeout, done).await.is_err() {
            tracing::error!(listener = %self.key, timeout = ?timeout, "Listener close timed out");
            return Err(ListenerError::CloseTimeout {
                key: self.key.clone(),
                timeout,
            });
        }

        tracing::info!(listener = %self.key, "Listener closed");
        Ok(())
    }

    /// Bound address, `None` unless listening.
    pub fn addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn status(&self) -> ListenerStatus {
        self.status
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    key: ListenerKey,
    socket: TcpListener,
    requests: mpsc::Sender<ConnectionRequest>,
    cancel: CancellationToken,
    done: oneshot::Sender<()>,
) {
    tracing::debug!(listener = %key, "Accept loop starting");

    loop {
        let request = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = socket.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(listener = %key, peer_addr = %peer, "Connection accepted");
                    ConnectionRequest::accepted(key.clone(), stream, peer)
                }
                Err(e) => {
                    tracing::error!(listener = %key, error = %e, "Accept error");
                    ConnectionRequest::failed(key.clone(), e)
                }
            },
        };

        let failed = request.is_err();
        tokio::select! {
            _ = cancel.cancelled() => break,
            sent = requests.send(request) => {
                if sent.is_err() {
                    tracing::debug!(listener = %key, "Request channel closed");
                    break;
                }
            }
        }

        if failed {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = time::sleep(ACCEPT_ERROR_BACKOFF) => {}
            }
        }
    }

    drop(socket);
    tracing::debug!(listener = %key, "Accept loop stopped");
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Accepted;
    use std::net::Ipv4Addr;
    use tokio::net::TcpStream;

    const LOCALHOST: IpAddr = IpAddr::V4(Ipv4Addr::LOCALHOST);

    async fn free_port() -> u16 {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        taken.local_addr().unwrap().port()
    }

    fn listener(port: u16, depth: usize) -> (Listener, mpsc::Receiver<ConnectionRequest>) {
        let (tx, rx) = mpsc::channel(depth);
        let key = ListenerKey::new(Protocol::Tcp, port);
        (Listener::new(key, LOCALHOST, tx, CancellationToken::new()), rx)
    }

    #[tokio::test]
    async fn lifecycle_moves_forward() {
        let port = free_port().await;
        let (mut l, _rx) = listener(port, 4);
        assert_eq!(l.status(), ListenerStatus::Ready);
        assert!(l.addr().is_none());

        l.listen().await.unwrap();
        assert_eq!(l.status(), ListenerStatus::Listening);
        assert_eq!(l.addr().unwrap().port(), port);

        assert!(matches!(l.listen().await, Err(ListenerError::AlreadyListening(_))));

        l.close(DEFAULT_CLOSE_TIMEOUT).await.unwrap();
        assert_eq!(l.status(), ListenerStatus::Closed);
        assert!(l.addr().is_none());
        assert!(matches!(l.listen().await, Err(ListenerError::Closed(_))));

        // closing twice is harmless
        l.close(DEFAULT_CLOSE_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn accepted_connections_are_queued() {
        let port = free_port().await;
        let (mut l, mut rx) = listener(port, 4);
        l.listen().await.unwrap();

        let _client = TcpStream::connect((LOCALHOST, port)).await.unwrap();
        let request = rx.recv().await.unwrap();
        assert_eq!(request.listener, ListenerKey::new(Protocol::Tcp, port));
        assert!(matches!(request.accepted, Accepted::Stream { .. }));

        l.close(DEFAULT_CLOSE_TIMEOUT).await.unwrap();
    }

    #[tokio::test]
    async fn close_timeout_still_marks_closed() {
        let (mut l, _rx) = listener(free_port().await, 1);
        // an accept loop that never acknowledges
        let (_stuck, done) = oneshot::channel();
        l.status = ListenerStatus::Listening;
        l.done = Some(done);

        let err = l.close(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, ListenerError::CloseTimeout { .. }));
        assert_eq!(l.status(), ListenerStatus::Closed);
        assert!(l.addr().is_none());

        // a second close does not wait again
        l.close(Duration::from_millis(50)).await.unwrap();
    }

    #[tokio::test]
    async fn close_releases_the_port() {
        let port = free_port().await;
        let (mut l, _rx) = listener(port, 4);
        l.listen().await.unwrap();
        l.close(DEFAULT_CLOSE_TIMEOUT).await.unwrap();

        let rebound = TcpListener::bind((LOCALHOST, port)).await;
        assert!(rebound.is_ok());
    }

    #[tokio::test]
    async fn close_is_not_blocked_by_a_full_queue() {
        let port = free_port().await;
        let (mut l, _rx) = listener(port, 1);
        l.listen().await.unwrap();

        let mut clients = Vec::new();
        for _ in 0..3 {
            clients.push(TcpStream::connect((LOCALHOST, port)).await.unwrap());
        }
        time::sleep(Duration::from_millis(50)).await;

        l.close(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn bind_conflict_is_reported() {
        let taken = TcpListener::bind((LOCALHOST, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let (mut l, _rx) = listener(port, 1);
        assert!(matches!(l.listen().await, Err(ListenerError::Bind { .. })));
        assert_eq!(l.status(), ListenerStatus::Ready);
    }

    #[tokio::test]
    async fn udp_is_unsupported() {
        let (tx, _rx) = mpsc::channel(1);
        let key = ListenerKey::new(Protocol::Udp, 5353);
        let mut l = Listener::new(key, LOCALHOST, tx, CancellationToken::new());
        assert!(matches!(
            l.listen().await,
            Err(ListenerError::UnsupportedProtocol(Protocol::Udp))
        ));
    }
}
