//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Orchestrator requires (protocol, port)
//!     → listener.rs (bind, accept loop)
//!     → connection.rs (ConnectionRequest envelope)
//!     → bounded request channel
//!     → dispatch loop (proxy::orchestrator)
//!
//! Listener States:
//!     Ready → Listening → Closed
//! ```
//!
//! # Design Decisions
//! - Bounded request queue gives natural backpressure on accepts
//! - One listener per (protocol, port); sockets are never double-bound
//! - TLS is only used by the public HTTP surface (tls.rs)

pub mod connection;
pub mod listener;
pub mod tls;

pub use connection::{Accepted, ConnectionId, ConnectionRequest};
pub use listener::{Listener, ListenerError, ListenerKey, ListenerStatus};
