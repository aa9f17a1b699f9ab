//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! TCP/TLS connection
//!     → server.rs (Axum setup, request ID, tracing, timeout)
//!     → routing::RoutingTable::resolve (host → Service)
//!     → request.rs (rewrite URI, strip hop-by-hop, x-forwarded-*)
//!     → upstream client
//!     → response.rs (intercept status: replay or substitute)
//!     → pages.rs (no-route / backend-unavailable pages)
//!     → Send to client
//! ```

pub mod pages;
pub mod request;
pub mod response;
pub mod server;

pub use pages::{Assets, ErrorPages, TemplateError};
pub use server::{build_router, upstream_client, AppState, HttpServer};
