//! Routing subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (Host header)
//!     → matcher.rs (normalize host, key claims host?)
//!     → router.rs (longest matching key, else default)
//!     → Return: RouteMatch::{Matched, Default, NoRoute}
//!
//! Table updates (orchestrator, under its lock):
//!     host key → Service map
//!     → new RoutingTable snapshot
//!     → Routes::publish (atomic swap)
//! ```
//!
//! # Design Decisions
//! - Snapshots are immutable; readers never observe a half-updated entry
//! - No regex in hot path (prefix matching only)
//! - Deterministic: same table and host always give the same route

pub mod matcher;
pub mod router;

pub use router::{RouteMatch, Routes, RoutingTable};
