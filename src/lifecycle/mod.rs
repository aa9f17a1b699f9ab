//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! Signals (signals.rs):
//!     SIGTERM/SIGINT/SIGHUP/SIGQUIT → Shutdown::trigger
//!
//! Shutdown (shutdown.rs):
//!     root token cancelled
//!     → HTTP servers drain and stop
//!     → Proxy::stop (watcher, listeners, channels)
//!     → exit
//! ```
//!
//! # Design Decisions
//! - One root cancellation token; every loop observes a child of it
//! - Shutdown steps are bounded by timeouts, never a blocking rendezvous

pub mod shutdown;
pub mod signals;

pub use shutdown::Shutdown;
pub use signals::shutdown_on_signal;
