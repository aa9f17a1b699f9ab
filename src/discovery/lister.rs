//! Backend-listing collaborators.
//!
//! # Responsibilities
//! - Fetch the current set of backends from the control plane
//! - Declare the proxy's own exposed ports on its management backend
//!
//! # Design Decisions
//! - The watcher and orchestrator only see the `BackendLister` trait
//! - `KubeLister` maps core/v1 Services; transport and auth come from kube's
//!   default client (in-cluster config or kubeconfig)
//! - `StaticLister` is an in-memory control plane for tests and local runs

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Service, ServicePort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use thiserror::Error;

use crate::discovery::backend::{Backend, PortSpec, Protocol};

/// Errors raised by a backend-listing collaborator.
#[derive(Debug, Error)]
pub enum ListError {
    /// The control-plane client could not be constructed.
    #[error("control plane client unavailable: {0}")]
    Connect(String),

    /// A list or update call failed.
    #[error("control plane request failed: {0}")]
    Request(String),

    /// The backend to update does not exist.
    #[error("backend {0} not found")]
    NotFound(String),
}

impl From<kube::Error> for ListError {
    fn from(e: kube::Error) -> Self {
        match &e {
            kube::Error::Api(resp) if resp.code == 404 => ListError::NotFound(resp.message.clone()),
            _ => ListError::Request(e.to_string()),
        }
    }
}

/// Source of truth for the set of routable backends.
#[async_trait]
pub trait BackendLister: Send + Sync {
    /// Return every backend currently known to the control plane.
    async fn list(&self) -> Result<Vec<Backend>, ListError>;

    /// Persist `backend`'s declared ports back to the control plane.
    async fn update(&self, backend: &Backend) -> Result<(), ListError>;
}

/// Lists core/v1 Services through the Kubernetes API.
#[derive(Clone)]
pub struct KubeLister {
    client: Client,
    namespace: Option<String>,
}

impl KubeLister {
    /// Build a lister from the default client configuration.
    ///
    /// `namespace` restricts listing to one namespace; `None` lists all.
    pub async fn try_default(namespace: Option<String>) -> Result<Self, ListError> {
        let client = Client::try_default()
            .await
            .map_err(|e| ListError::Connect(e.to_string()))?;
        Ok(Self { client, namespace })
    }

    fn services(&self) -> Api<Service> {
        match &self.namespace {
            Some(ns) => Api::namespaced(self.client.clone(), ns),
            None => Api::all(self.client.clone()),
        }
    }
}

#[async_trait]
impl BackendLister for KubeLister {
    async fn list(&self) -> Result<Vec<Backend>, ListError> {
        let services = self.services().list(&ListParams::default()).await?;
        Ok(services.items.iter().filter_map(backend_from_service).collect())
    }

    async fn update(&self, backend: &Backend) -> Result<(), ListError> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), &backend.namespace);
        let mut service = api.get(&backend.name).await?;

        let spec = service.spec.get_or_insert_with(Default::default);
        let ports = spec.ports.get_or_insert_with(Vec::new);
        let mut changed = false;
        for declared in &backend.ports {
            let exists = ports.iter().any(|p| {
                p.port == i32::from(declared.port)
                    && Protocol::parse(p.protocol.as_deref()) == declared.protocol
            });
            if !exists {
                ports.push(service_port(declared));
                changed = true;
            }
        }

        if !changed {
            return Ok(());
        }

        api.replace(&backend.name, &PostParams::default(), &service)
            .await?;
        tracing::info!(backend = %backend, "Management service ports updated");
        Ok(())
    }
}

/// Convert a Service into a Backend. Services without a name are skipped.
pub fn backend_from_service(service: &Service) -> Option<Backend> {
    let name = service.metadata.name.clone()?;
    let namespace = service
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let labels = service.metadata.labels.clone().unwrap_or_default();

    let ports = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .map(|ports| ports.iter().filter_map(port_from_service_port).collect())
        .unwrap_or_default();

    Some(Backend {
        name,
        namespace,
        labels,
        ports,
    })
}

fn port_from_service_port(port: &ServicePort) -> Option<PortSpec> {
    let exposed = u16::try_from(port.port).ok()?;
    let target_port = match &port.target_port {
        Some(IntOrString::Int(p)) => u16::try_from(*p).ok(),
        _ => None,
    };
    Some(PortSpec {
        name: port.name.clone(),
        protocol: Protocol::parse(port.protocol.as_deref()),
        port: exposed,
        target_port,
    })
}

fn service_port(port: &PortSpec) -> ServicePort {
    ServicePort {
        // port names must be DNS labels
        name: Some(
            port.name
                .clone()
                .unwrap_or_else(|| format!("{}-{}", port.protocol, port.port)),
        ),
        protocol: Some(port.protocol.as_str().to_uppercase()),
        port: i32::from(port.port),
        target_port: Some(IntOrString::Int(i32::from(
            port.target_port.unwrap_or(port.port),
        ))),
        ..Default::default()
    }
}

/// In-memory control plane.
#[derive(Debug, Default)]
pub struct StaticLister {
    state: Mutex<StaticState>,
}

#[derive(Debug, Default)]
struct StaticState {
    backends: Vec<Backend>,
    failing: bool,
    delay: Option<Duration>,
    update_delay: Option<Duration>,
    updates: Vec<Backend>,
}

impl StaticLister {
    pub fn new(backends: Vec<Backend>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                backends,
                ..Default::default()
            }),
        }
    }

    /// Replace the reported backend set.
    pub fn set_backends(&self, backends: Vec<Backend>) {
        self.lock().backends = backends;
    }

    /// Make subsequent `list` calls fail until reset.
    pub fn set_failing(&self, failing: bool) {
        self.lock().failing = failing;
    }

    /// Delay every `list` call, simulating a slow control plane.
    pub fn set_delay(&self, delay: Option<Duration>) {
        self.lock().delay = delay;
    }

    /// Delay every `update` call.
    pub fn set_update_delay(&self, delay: Option<Duration>) {
        self.lock().update_delay = delay;
    }

    /// Backends passed to `update`, in call order.
    pub fn updates(&self) -> Vec<Backend> {
        self.lock().updates.clone()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StaticState> {
        self.state.lock().expect("static lister mutex poisoned")
    }
}

#[async_trait]
impl BackendLister for StaticLister {
    async fn list(&self) -> Result<Vec<Backend>, ListError> {
        let delay = self.lock().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let state = self.lock();
        if state.failing {
            return Err(ListError::Request("static lister set to fail".into()));
        }
        Ok(state.backends.clone())
    }

    async fn update(&self, backend: &Backend) -> Result<(), ListError> {
        let delay = self.lock().update_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let mut state = self.lock();
        let Some(existing) = state
            .backends
            .iter_mut()
            .find(|b| b.name == backend.name && b.namespace == backend.namespace)
        else {
            return Err(ListError::NotFound(backend.id()));
        };
        *existing = backend.clone();
        state.updates.push(backend.clone());
        Ok(())
    }
}
