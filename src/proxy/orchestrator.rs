//! Proxy orchestrator.
//!
//! # Responsibilities
//! - Admit discovered backends into the routing table
//! - Create one listener per required (protocol, port) pair
//! - Dispatch accepted raw connections to their backend
//! - Coordinate an ordered, best-effort shutdown
//!
//! # Design Decisions
//! - All table and listener mutation happens under one async mutex
//! - Readers use published snapshots (`Routes`) and never take the lock
//! - Listeners persist after their last backend disappears

use std::collections::{BTreeMap, HashMap};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time;
use tokio_util::sync::CancellationToken;

use crate::config::ProxyConfig;
use crate::discovery::backend::{Backend, PortSpec, Protocol};
use crate::discovery::lister::BackendLister;
use crate::discovery::watcher::{ChangeSet, WatchError, WatchHandle, Watcher};
use crate::net::connection::{Accepted, ConnectionRequest};
use crate::net::listener::{Listener, ListenerKey, ListenerStatus};
use crate::observability::metrics;
use crate::proxy::conn::Conn;
use crate::proxy::error::{ErrorKind, ProxyError};
use crate::proxy::service::Service;
use crate::routing::{Routes, RoutingTable};

/// Orchestrator settings, usually derived from [`ProxyConfig`].
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    pub bind_ip: IpAddr,
    /// Ports owned by the HTTP surface; never bound as raw listeners.
    pub http_ports: Vec<u16>,
    pub management_service: String,
    pub reserved_namespaces: Vec<String>,
    pub host_label: String,
    pub default_backend: Option<String>,
    pub cluster_domain: String,
    pub request_queue_depth: usize,
    pub watch_interval: Option<Duration>,
    pub close_timeout: Duration,
    pub stop_timeout: Duration,
    pub connect_timeout: Duration,
}

impl ProxyOptions {
    pub fn from_config(config: &ProxyConfig) -> Self {
        let listener = &config.listener;
        let discovery = &config.discovery;

        let mut http_ports = vec![listener.http_port];
        if listener.tls.is_some() {
            http_ports.push(listener.https_port);
        }

        Self {
            bind_ip: listener.bind_ip,
            http_ports,
            management_service: discovery.management_service.clone(),
            reserved_namespaces: discovery.reserved_namespaces.clone(),
            host_label: discovery.host_label.clone(),
            default_backend: discovery.default_backend.clone(),
            cluster_domain: discovery.cluster_domain.clone(),
            request_queue_depth: listener.request_queue_depth.max(1),
            watch_interval: discovery.interval(),
            close_timeout: listener.close_timeout(),
            stop_timeout: discovery.stop_timeout(),
            connect_timeout: config.timeouts.connect(),
        }
    }
}

impl Default for ProxyOptions {
    fn default() -> Self {
        Self::from_config(&ProxyConfig::default())
    }
}

#[derive(Default)]
struct ProxyState {
    services: BTreeMap<String, Arc<Service>>,
    listeners: HashMap<ListenerKey, Listener>,
    /// Last sighting of the proxy's own backend.
    management: Option<Backend>,
    stopped: bool,
}

#[derive(Default)]
struct Tasks {
    watcher: Option<WatchHandle>,
    dispatch: Option<JoinHandle<()>>,
    applier: Option<JoinHandle<()>>,
    cancel: Option<CancellationToken>,
}

/// The reconciliation engine.
pub struct Proxy {
    options: ProxyOptions,
    lister: Arc<dyn BackendLister>,
    state: Mutex<ProxyState>,
    routes: Arc<Routes>,
    requests: mpsc::Sender<ConnectionRequest>,
    inbox: std::sync::Mutex<Option<mpsc::Receiver<ConnectionRequest>>>,
    tasks: Mutex<Tasks>,
    ready: watch::Sender<bool>,
    shutdown: CancellationToken,
}

impl Proxy {
    /// `shutdown` is the process-wide token; every loop observes a child of it.
    pub fn new(
        options: ProxyOptions,
        lister: Arc<dyn BackendLister>,
        shutdown: CancellationToken,
    ) -> Self {
        let (requests, inbox) = mpsc::channel(options.request_queue_depth.max(1));
        let (ready, _) = watch::channel(false);

        Self {
            options,
            lister,
            state: Mutex::new(ProxyState::default()),
            routes: Arc::new(Routes::default()),
            requests,
            inbox: std::sync::Mutex::new(Some(inbox)),
            tasks: Mutex::new(Tasks::default()),
            ready,
            shutdown,
        }
    }

    pub fn options(&self) -> &ProxyOptions {
        &self.options
    }

    /// Shared handle to the published routing snapshots.
    pub fn routes(&self) -> Arc<Routes> {
        Arc::clone(&self.routes)
    }

    /// True once the first discovery snapshot has been applied.
    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    pub fn ready_signal(&self) -> watch::Receiver<bool> {
        self.ready.subscribe()
    }

    /// Admit a backend, creating any listeners its ports require.
    pub async fn add_backend(&self, backend: Backend) -> Result<(), ProxyError> {
        if backend.name == self.options.management_service {
            self.remember_management(backend.clone()).await;
            return Err(ProxyError::Reserved(backend.id()));
        }
        if self.options.reserved_namespaces.contains(&backend.namespace) {
            return Err(ProxyError::Reserved(backend.id()));
        }

        let host_key = backend.host_key(&self.options.host_label);
        let mut state = self.state.lock().await;
        if state.stopped {
            return Err(ProxyError::Stopped);
        }

        let service = match state.services.get(&host_key) {
            Some(existing) => {
                tracing::debug!(host = %host_key, backend = %backend, "Refreshing backend");
                let mut refreshed = Service::clone(existing);
                refreshed.refresh(backend, &self.options.cluster_domain);
                refreshed
            }
            None => {
                tracing::info!(host = %host_key, backend = %backend, "Adding backend");
                Service::new(backend, host_key.clone(), &self.options.cluster_domain)
            }
        };
        let required: Vec<ListenerKey> = service.listener_keys().cloned().collect();
        state.services.insert(host_key.clone(), Arc::new(service));
        self.publish(&state);

        let mut created = Vec::new();
        let mut result = Ok(());
        for key in required {
            match self.ensure_listener(&mut state, key.clone()).await {
                Ok(true) => created.push(key),
                Ok(false) => {}
                Err(e) if e.is_idempotent() => {
                    tracing::trace!(listener = %key, "Listener already satisfied");
                }
                Err(e) => {
                    tracing::error!(host = %host_key, listener = %key, error = %e, "Listener failed");
                    result = Err(e);
                    break;
                }
            }
        }

        let management = state.management.clone().filter(|_| !created.is_empty());
        drop(state);

        if let Some(management) = management {
            self.declare_or_warn(management, &created).await;
        }
        result
    }

    /// Drop a backend's routing entry. Its listeners stay open.
    pub async fn remove_backend(&self, backend: &Backend) -> Result<(), ProxyError> {
        let host_key = backend.host_key(&self.options.host_label);
        let mut state = self.state.lock().await;

        if state.services.remove(&host_key).is_none() {
            return Err(ProxyError::NotFound(host_key));
        }

        tracing::info!(host = %host_key, backend = %backend, "Removing backend");
        self.publish(&state);
        Ok(())
    }

    /// Apply every addition, then every removal. Per-item errors are logged.
    pub async fn apply_change_set(&self, changes: ChangeSet) {
        for (id, backend) in changes.added {
            if let Err(e) = self.add_backend(backend).await {
                log_item_error("add", &id, &e);
            }
        }
        for (id, backend) in changes.removed {
            if let Err(e) = self.remove_backend(&backend).await {
                log_item_error("remove", &id, &e);
            }
        }
    }

    /// Start discovery and dispatch, returning once the first snapshot is applied.
    pub async fn start(self: &Arc<Self>) -> Result<(), ProxyError> {
        let cancel = self.shutdown.child_token();

        let inbox = self
            .inbox
            .lock()
            .expect("proxy inbox mutex poisoned")
            .take()
            .ok_or(ProxyError::Stopped)?;

        let mut handle = Watcher::new(Arc::clone(&self.lister), self.options.watch_interval)
            .watch(cancel.clone());
        let mut changes = handle.take_changes().ok_or(WatchError::Closed)?;
        let mut ready = handle.ready_signal();

        let dispatch = tokio::spawn(dispatch_loop(
            inbox,
            self.routes(),
            self.options.connect_timeout,
            cancel.clone(),
        ));

        {
            let mut tasks = self.tasks.lock().await;
            tasks.watcher = Some(handle);
            tasks.dispatch = Some(dispatch);
            tasks.cancel = Some(cancel.clone());
        }

        tokio::select! {
            waited = ready.wait_for(|ready| *ready) => {
                waited.map_err(|_| WatchError::Closed)?;
            }
            _ = cancel.cancelled() => return Err(ProxyError::Stopped),
        }

        while let Ok(initial) = changes.try_recv() {
            self.apply_change_set(initial).await;
        }

        let applier = tokio::spawn(apply_loop(Arc::clone(self), changes, cancel.clone()));
        self.tasks.lock().await.applier = Some(applier);

        self.ready.send_replace(true);
        tracing::info!(routes = self.routes.load().len(), "Proxy ready");
        Ok(())
    }

    /// Stop discovery, close listeners, drain both channels.
    ///
    /// Every step runs even if an earlier one failed.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let mut errors: Vec<ProxyError> = Vec::new();
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        self.ready.send_replace(false);

        if let Some(watcher) = &tasks.watcher {
            if let Err(e) = watcher.stop(self.options.stop_timeout).await {
                tracing::error!(error = %e, "Watcher did not stop cleanly");
                errors.push(e.into());
            }
        }

        {
            let mut state = self.state.lock().await;
            state.stopped = true;
            for (key, mut listener) in state.listeners.drain() {
                if let Err(e) = listener.close(self.options.close_timeout).await {
                    tracing::error!(listener = %key, error = %e, "Listener did not close cleanly");
                    errors.push(e.into());
                }
            }
            metrics::set_listeners(0);
        }

        if let Some(cancel) = &tasks.cancel {
            cancel.cancel();
        }

        if let Some(mut inbox) = self.inbox.lock().expect("proxy inbox mutex poisoned").take() {
            drain(&mut inbox);
        }
        if let Some(dispatch) = tasks.dispatch {
            if let Err(e) = self.join("dispatch", dispatch).await {
                errors.push(e);
            }
        }
        if let Some(applier) = tasks.applier {
            if let Err(e) = self.join("change", applier).await {
                errors.push(e);
            }
        }

        tracing::info!(errors = errors.len(), "Proxy stopped");
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ProxyError::Shutdown(errors))
        }
    }

    pub async fn listener_status(&self, key: &ListenerKey) -> Option<ListenerStatus> {
        self.state.lock().await.listeners.get(key).map(Listener::status)
    }

    pub async fn listener_addr(&self, key: &ListenerKey) -> Option<SocketAddr> {
        self.state.lock().await.listeners.get(key).and_then(Listener::addr)
    }

    pub async fn listener_keys(&self) -> Vec<ListenerKey> {
        let mut keys: Vec<_> = self.state.lock().await.listeners.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Returns `Ok(true)` when a new listener was bound.
    async fn ensure_listener(
        &self,
        state: &mut ProxyState,
        key: ListenerKey,
    ) -> Result<bool, ProxyError> {
        if key.protocol == Protocol::Tcp && self.options.http_ports.contains(&key.port) {
            return Ok(false);
        }
        if state.listeners.contains_key(&key) {
            return Err(ProxyError::AlreadyExists(key));
        }

        let mut listener = Listener::new(
            key.clone(),
            self.options.bind_ip,
            self.requests.clone(),
            self.shutdown.child_token(),
        );
        listener.listen().await?;

        state.listeners.insert(key, listener);
        metrics::set_listeners(state.listeners.len());
        Ok(true)
    }

    fn publish(&self, state: &ProxyState) {
        let table = RoutingTable::new(state.services.clone(), self.options.default_backend.clone());
        metrics::set_routes(table.len());
        self.routes.publish(table);
    }

    async fn remember_management(&self, backend: Backend) {
        let open: Vec<ListenerKey> = {
            let mut state = self.state.lock().await;
            state.management = Some(backend.clone());
            state.listeners.keys().cloned().collect()
        };
        self.declare_or_warn(backend, &open).await;
    }

    async fn declare_or_warn(&self, management: Backend, keys: &[ListenerKey]) {
        let id = management.id();
        if let Err(e) = self.declare_ports(management, keys).await {
            tracing::warn!(backend = %id, kind = ?e.kind(), error = %e, "Failed to declare listener ports");
        }
    }

    /// Make sure the management backend declares every listener port.
    async fn declare_ports(
        &self,
        mut management: Backend,
        keys: &[ListenerKey],
    ) -> Result<(), ProxyError> {
        let mut changed = false;
        for key in keys {
            let declared = management
                .ports
                .iter()
                .any(|p| p.protocol == key.protocol && p.port == key.port);
            if !declared {
                management.ports.push(PortSpec::new(key.protocol.clone(), key.port));
                changed = true;
            }
        }
        if !changed {
            return Ok(());
        }

        self.lister.update(&management).await?;
        tracing::info!(backend = %management, ports = management.ports.len(), "Declared listener ports");
        self.state.lock().await.management = Some(management);
        Ok(())
    }

    async fn join(&self, task: &'static str, handle: JoinHandle<()>) -> Result<(), ProxyError> {
        let timeout = self.options.stop_timeout;
        match time::timeout(timeout, handle).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => {
                tracing::error!(task, error = %e, "Task panicked");
                Ok(())
            }
            Err(_) => Err(ProxyError::TaskTimeout { task, timeout }),
        }
    }
}

fn log_item_error(action: &str, id: &str, e: &ProxyError) {
    match e.kind() {
        ErrorKind::Reserved => tracing::debug!(action, backend = %id, "Skipping reserved backend"),
        _ => tracing::warn!(action, backend = %id, error = %e, "Failed to apply backend change"),
    }
}

fn drain<T>(rx: &mut mpsc::Receiver<T>) -> usize {
    rx.close();
    let mut dropped = 0;
    while rx.try_recv().is_ok() {
        dropped += 1;
    }
    dropped
}

async fn apply_loop(
    proxy: Arc<Proxy>,
    mut changes: mpsc::Receiver<ChangeSet>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = changes.recv() => match next {
                Some(change_set) => proxy.apply_change_set(change_set).await,
                None => break,
            },
        }
    }

    let dropped = drain(&mut changes);
    tracing::debug!(dropped, "Change loop stopped");
}

async fn dispatch_loop(
    mut inbox: mpsc::Receiver<ConnectionRequest>,
    routes: Arc<Routes>,
    connect_timeout: Duration,
    cancel: CancellationToken,
) {
    loop {
        let request = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            next = inbox.recv() => match next {
                Some(request) => request,
                None => break,
            },
        };
        dispatch(request, &routes.load(), connect_timeout, &cancel);
    }

    let dropped = drain(&mut inbox);
    tracing::debug!(dropped, "Dispatch loop stopped");
}

/// Why a raw connection could not be paired with a backend.
#[derive(Debug, PartialEq, Eq)]
pub enum DispatchMiss {
    NoBackend,
    Ambiguous(usize),
}

/// Pick the single Conn serving `listener`.
pub fn select_conn(table: &RoutingTable, listener: &ListenerKey) -> Result<Conn, DispatchMiss> {
    let candidates = table.services_for(listener);
    match candidates.as_slice() {
        [service] => service.conn_for(listener).cloned().ok_or(DispatchMiss::NoBackend),
        [] => Err(DispatchMiss::NoBackend),
        many => Err(DispatchMiss::Ambiguous(many.len())),
    }
}

/// Relays run until either side closes or `cancel` fires.
fn dispatch(
    request: ConnectionRequest,
    table: &RoutingTable,
    connect_timeout: Duration,
    cancel: &CancellationToken,
) {
    let ConnectionRequest {
        id,
        listener,
        accepted,
    } = request;

    let (stream, peer) = match accepted {
        Accepted::Stream { stream, peer } => (stream, peer),
        Accepted::Failed(e) => {
            tracing::warn!(connection_id = %id, listener = %listener, error = %e, "Accept failed");
            return;
        }
    };

    let conn = match select_conn(table, &listener) {
        Ok(conn) => conn,
        Err(miss) => {
            tracing::warn!(
                connection_id = %id,
                listener = %listener,
                peer_addr = %peer,
                reason = ?miss,
                "No unique backend for connection, dropping"
            );
            return;
        }
    };

    let cancel = cancel.clone();
    tokio::spawn(async move {
        let passed = tokio::select! {
            passed = conn.pass(stream, connect_timeout) => passed,
            _ = cancel.cancelled() => {
                tracing::debug!(connection_id = %id, conn = %conn, "Relay cancelled by shutdown");
                return;
            }
        };
        match passed {
            Ok(stats) => {
                metrics::record_tcp_bytes(stats.upstream_written, stats.client_written);
                tracing::debug!(connection_id = %id, conn = %conn, ?stats, "Connection closed");
            }
            Err(e) => {
                tracing::warn!(connection_id = %id, conn = %conn, error = %e, "Passthrough failed");
            }
        }
    });
}
