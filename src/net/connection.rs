//! Accepted-connection envelopes.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Carry an accepted socket (or the accept error) from a listener to the
//!   dispatch loop

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::net::TcpStream;

use crate::net::listener::ListenerKey;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since we only need uniqueness.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// What a listener's accept call produced.
#[derive(Debug)]
pub enum Accepted {
    Stream { stream: TcpStream, peer: SocketAddr },
    Failed(io::Error),
}

/// Envelope queued on the shared request channel.
#[derive(Debug)]
pub struct ConnectionRequest {
    pub id: ConnectionId,
    /// The listener that accepted (or failed to accept) the connection.
    pub listener: ListenerKey,
    pub accepted: Accepted,
}

impl ConnectionRequest {
    pub fn accepted(listener: ListenerKey, stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            id: ConnectionId::new(),
            listener,
            accepted: Accepted::Stream { stream, peer },
        }
    }

    pub fn failed(listener: ListenerKey, error: io::Error) -> Self {
        Self {
            id: ConnectionId::new(),
            listener,
            accepted: Accepted::Failed(error),
        }
    }

    pub fn is_err(&self) -> bool {
        matches!(self.accepted, Accepted::Failed(_))
    }
}
