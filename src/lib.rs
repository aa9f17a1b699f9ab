//! Dynamic cluster reverse proxy.
//!
//! Discovers backends from the cluster control plane and keeps a routing
//! table and a set of listeners reconciled with them at runtime.

pub mod config;
pub mod discovery;
pub mod http;
pub mod lifecycle;
pub mod net;
pub mod observability;
pub mod proxy;
pub mod routing;

pub use config::ProxyConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
pub use proxy::{Proxy, ProxyError, ProxyOptions};
