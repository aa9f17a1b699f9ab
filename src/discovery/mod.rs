//! Service discovery subsystem.
//!
//! # Data Flow
//! ```text
//! control plane (Kubernetes API)
//!     → lister.rs (BackendLister::list)
//!     → watcher.rs (snapshot, diff by identity)
//!     → ChangeSet { added, removed }
//!     → proxy::orchestrator (apply_change_set)
//! ```
//!
//! # Design Decisions
//! - Polling, not streaming watches: one list call per interval
//! - Only appearance and disappearance are reported
//! - Nothing is persisted; every start rebuilds from the control plane

pub mod backend;
pub mod lister;
pub mod watcher;

pub use backend::{Backend, PortSpec, Protocol};
pub use lister::{BackendLister, KubeLister, ListError, StaticLister};
pub use watcher::{diff, ChangeSet, Snapshot, WatchError, WatchHandle, Watcher};
