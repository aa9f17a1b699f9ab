//! Routing table and lookup.
//!
//! # Responsibilities
//! - Hold an immutable snapshot of host key → Service
//! - Resolve an inbound host to a Service (longest key wins)
//! - Publish new snapshots atomically for lock-free readers
//!
//! # Design Decisions
//! - Writers build a fresh snapshot and swap it in; readers never block them
//! - A configured default key is the fallback when nothing matches
//! - Explicit `None` rather than a silent catch-all when no default exists

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;

use crate::net::listener::ListenerKey;
use crate::proxy::service::Service;
use crate::routing::matcher::{key_matches, normalize_host};

/// Outcome of resolving a host.
#[derive(Debug, Clone)]
pub enum RouteMatch {
    /// A registered key claims the host.
    Matched(Arc<Service>),
    /// Nothing matched; the default backend is used.
    Default(Arc<Service>),
    /// Nothing matched and no default backend is registered.
    NoRoute,
}

impl RouteMatch {
    pub fn service(&self) -> Option<&Arc<Service>> {
        match self {
            RouteMatch::Matched(s) | RouteMatch::Default(s) => Some(s),
            RouteMatch::NoRoute => None,
        }
    }
}

/// Immutable routing snapshot.
#[derive(Debug, Clone, Default)]
pub struct RoutingTable {
    services: BTreeMap<String, Arc<Service>>,
    default_key: Option<String>,
}

impl RoutingTable {
    pub fn new(services: BTreeMap<String, Arc<Service>>, default_key: Option<String>) -> Self {
        Self {
            services,
            default_key: default_key.map(|k| k.to_lowercase()),
        }
    }

    /// Resolve a raw Host header value.
    pub fn resolve(&self, host: &str) -> RouteMatch {
        let host = normalize_host(host);

        let best = self
            .services
            .iter()
            .filter(|(key, _)| key_matches(key, &host))
            .max_by_key(|(key, _)| key.len());

        if let Some((_, service)) = best {
            return RouteMatch::Matched(Arc::clone(service));
        }

        match self.default_key.as_ref().and_then(|k| self.services.get(k)) {
            Some(service) => RouteMatch::Default(Arc::clone(service)),
            None => RouteMatch::NoRoute,
        }
    }

    pub fn get(&self, key: &str) -> Option<&Arc<Service>> {
        self.services.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.services.contains_key(key)
    }

    /// Registered host keys in sorted order.
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.services.keys().map(String::as_str)
    }

    /// Services whose Conns require `listener`.
    pub fn services_for(&self, listener: &ListenerKey) -> Vec<Arc<Service>> {
        self.services
            .values()
            .filter(|s| s.conn_for(listener).is_some())
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Shared handle to the current routing snapshot.
#[derive(Debug)]
pub struct Routes {
    current: ArcSwap<RoutingTable>,
}

impl Routes {
    pub fn new(table: RoutingTable) -> Self {
        Self {
            current: ArcSwap::from_pointee(table),
        }
    }

    /// The snapshot as of now.
    pub fn load(&self) -> Arc<RoutingTable> {
        self.current.load_full()
    }

    pub fn publish(&self, table: RoutingTable) {
        self.current.store(Arc::new(table));
    }
}

impl Default for Routes {
    fn default() -> Self {
        Self::new(RoutingTable::default())
    }
}
