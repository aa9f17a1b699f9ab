//! Proxy core.
//!
//! # Data Flow
//! ```text
//! Watcher ChangeSet
//!     → orchestrator.rs (add/remove backends, under one lock)
//!     → service.rs (Backend + Conns + upstream URL)
//!     → routing::Routes (published snapshot)
//!     → listeners for every required (protocol, port)
//!
//! Accepted raw connection (request channel)
//!     → orchestrator.rs dispatch loop
//!     → conn.rs (dial backend, relay both directions)
//! ```
//!
//! # Design Decisions
//! - Errors carry a kind so idempotent outcomes are not mistaken for failures
//! - Shutdown aggregates every step's error instead of stopping at the first

pub mod conn;
pub mod error;
pub mod orchestrator;
pub mod service;

pub use conn::{Conn, RelayError, RelayStats};
pub use error::{ErrorKind, ProxyError};
pub use orchestrator::{Proxy, ProxyOptions};
pub use service::Service;
