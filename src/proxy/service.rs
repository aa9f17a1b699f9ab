//! Routable service entries.
//!
//! # Responsibilities
//! - Derive one Conn per declared (protocol, port)
//! - Compute the cluster-internal DNS name and upstream URL
//! - Recompute Conns on refresh without touching listeners

use std::collections::BTreeMap;
use std::sync::Arc;

use url::Url;

use crate::discovery::backend::Backend;
use crate::net::listener::ListenerKey;
use crate::proxy::conn::Conn;

/// A backend that has been admitted to the routing table.
#[derive(Debug, Clone)]
pub struct Service {
    backend: Arc<Backend>,
    host_key: String,
    dns_host: String,
    conns: BTreeMap<ListenerKey, Conn>,
    upstream: Option<Url>,
}

impl Service {
    pub fn new(backend: Backend, host_key: impl Into<String>, cluster_domain: &str) -> Self {
        let dns_host = dns_host(&backend, cluster_domain);
        let backend = Arc::new(backend);
        let conns = build_conns(&backend, &dns_host);
        let upstream = upstream_url(&backend, &dns_host);

        Self {
            backend,
            host_key: host_key.into(),
            dns_host,
            conns,
            upstream,
        }
    }

    /// Replace the backend model and recompute Conns.
    pub fn refresh(&mut self, backend: Backend, cluster_domain: &str) {
        self.dns_host = dns_host(&backend, cluster_domain);
        self.backend = Arc::new(backend);
        self.conns = build_conns(&self.backend, &self.dns_host);
        self.upstream = upstream_url(&self.backend, &self.dns_host);
    }

    pub fn backend(&self) -> &Backend {
        &self.backend
    }

    pub fn host_key(&self) -> &str {
        &self.host_key
    }

    /// `<name>.<namespace>.<cluster domain>`
    pub fn dns_host(&self) -> &str {
        &self.dns_host
    }

    pub fn conns(&self) -> impl Iterator<Item = &Conn> {
        self.conns.values()
    }

    pub fn conn_for(&self, key: &ListenerKey) -> Option<&Conn> {
        self.conns.get(key)
    }

    pub fn listener_keys(&self) -> impl Iterator<Item = &ListenerKey> {
        self.conns.keys()
    }

    /// HTTP base URL for forwarding; `None` when no port is declared.
    pub fn upstream(&self) -> Option<&Url> {
        self.upstream.as_ref()
    }
}

fn dns_host(backend: &Backend, cluster_domain: &str) -> String {
    let domain = cluster_domain.trim_matches('.');
    if domain.is_empty() {
        format!("{}.{}", backend.name, backend.namespace).to_lowercase()
    } else {
        format!("{}.{}.{}", backend.name, backend.namespace, domain).to_lowercase()
    }
}

fn build_conns(backend: &Arc<Backend>, dns_host: &str) -> BTreeMap<ListenerKey, Conn> {
    backend
        .ports
        .iter()
        .map(|p| {
            let conn = Conn::new(p.protocol.clone(), dns_host, p.port, Arc::clone(backend));
            (conn.listener_key(), conn)
        })
        .collect()
}

fn upstream_url(backend: &Backend, dns_host: &str) -> Option<Url> {
    let port = backend.ports.first()?.port;
    Url::parse(&format!("http://{}:{}", dns_host, port)).ok()
}
