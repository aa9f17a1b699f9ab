//! Discovered backend model.
//!
//! # Responsibilities
//! - Represent one service reported by the control plane
//! - Normalize declared port protocols
//! - Derive the routing host key (label override, else name)
//!
//! # Design Decisions
//! - Identity is `namespace/name`; the host key is derived, not stored
//! - Protocols are lower-cased at construction, missing means `tcp`

use std::collections::BTreeMap;
use std::fmt;

/// Network protocol of a declared port.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
    Sctp,
    /// Anything the control plane reports that we do not know about.
    Other(String),
}

impl Protocol {
    /// Parse a control-plane protocol string. Empty or missing means TCP.
    pub fn parse(raw: Option<&str>) -> Self {
        match raw.map(|p| p.trim().to_lowercase()).as_deref() {
            None | Some("") | Some("tcp") => Protocol::Tcp,
            Some("udp") => Protocol::Udp,
            Some("sctp") => Protocol::Sctp,
            Some(other) => Protocol::Other(other.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Sctp => "sctp",
            Protocol::Other(p) => p,
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One declared (protocol, exposed port, target port) triple.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortSpec {
    /// Optional port name from the control plane.
    pub name: Option<String>,
    pub protocol: Protocol,
    /// Port exposed by the service and listened on by the proxy.
    pub port: u16,
    /// Port on the workload the service forwards to.
    pub target_port: Option<u16>,
}

impl PortSpec {
    pub fn new(protocol: Protocol, port: u16) -> Self {
        Self {
            name: None,
            protocol,
            port,
            target_port: None,
        }
    }

    pub fn with_target(mut self, target_port: u16) -> Self {
        self.target_port = Some(target_port);
        self
    }
}

/// A discovered, routable upstream service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Backend {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub ports: Vec<PortSpec>,
}

impl Backend {
    pub fn new(name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    pub fn with_port(mut self, port: PortSpec) -> Self {
        self.ports.push(port);
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Stable identity within the cluster.
    pub fn id(&self) -> String {
        format!("{}/{}", self.namespace, self.name)
    }

    /// Routing key: the value of `host_label` when set, else the name.
    pub fn host_key(&self, host_label: &str) -> String {
        self.labels
            .get(host_label)
            .map(|h| h.trim())
            .filter(|h| !h.is_empty())
            .unwrap_or(&self.name)
            .to_lowercase()
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}
