//! HTTP server setup and configuration.
//!
//! # Responsibilities
//! - Create Axum Router with liveness, readiness and catch-all proxy handlers
//! - Wire up middleware (tracing, request ID, timeout)
//! - Resolve the request host against the published routing snapshot
//! - Forward requests to upstream backends through the response interceptor
//! - Serve plaintext and TLS from the same state

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, Response, StatusCode},
    response::IntoResponse,
    routing::get,
    Router,
};
use axum_server::tls_rustls::RustlsConfig;
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client},
    rt::TokioExecutor,
};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tower_http::{
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use url::Url;

use crate::http::pages::{Assets, ErrorPages};
use crate::http::request::{request_host, upstream_request};
use crate::http::response::{
    failure_response, intercept, passthrough, unavailable_response, Intercepted,
};
use crate::observability::metrics;
use crate::proxy::Proxy;
use crate::routing::{RouteMatch, Routes};

/// How long in-flight requests may finish after shutdown begins.
const GRACE_PERIOD: Duration = Duration::from_secs(5);

pub type UpstreamClient = Client<HttpConnector, Body>;

/// Build the forwarding client.
pub fn upstream_client(connect_timeout: Duration) -> UpstreamClient {
    let mut connector = HttpConnector::new();
    connector.set_connect_timeout(Some(connect_timeout));
    Client::builder(TokioExecutor::new()).build(connector)
}

/// Application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub routes: Arc<Routes>,
    pub ready: watch::Receiver<bool>,
    pub pages: Arc<ErrorPages>,
    pub assets: Arc<Assets>,
    pub client: UpstreamClient,
    /// Scheme clients used to reach this server.
    pub scheme: &'static str,
}

impl AppState {
    pub fn new(proxy: &Proxy, pages: Arc<ErrorPages>, assets: Arc<Assets>, client: UpstreamClient) -> Self {
        Self {
            routes: proxy.routes(),
            ready: proxy.ready_signal(),
            pages,
            assets,
            client,
            scheme: "http",
        }
    }

    /// The same state, labelled for the TLS listener.
    pub fn secure(&self) -> Self {
        Self {
            scheme: "https",
            ..self.clone()
        }
    }

    fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }
}

/// HTTP server for the reverse proxy.
pub struct HttpServer {
    router: Router,
}

impl HttpServer {
    pub fn new(state: AppState, request_timeout: Duration) -> Self {
        Self {
            router: build_router(state, request_timeout),
        }
    }

    /// Serve plaintext HTTP until `shutdown` fires.
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> io::Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(address = %addr, "HTTP server starting");

        let app = self.router.into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await?;

        tracing::info!(address = %addr, "HTTP server stopped");
        Ok(())
    }

    /// Serve HTTPS on `addr` until `shutdown` fires.
    pub async fn serve_tls(
        self,
        addr: SocketAddr,
        tls: RustlsConfig,
        shutdown: CancellationToken,
    ) -> io::Result<()> {
        tracing::info!(address = %addr, "HTTPS server starting");

        let handle = axum_server::Handle::new();
        let trigger = handle.clone();
        tokio::spawn(async move {
            shutdown.cancelled().await;
            trigger.graceful_shutdown(Some(GRACE_PERIOD));
        });

        axum_server::bind_rustls(addr, tls)
            .handle(handle)
            .serve(self.router.into_make_service_with_connect_info::<SocketAddr>())
            .await?;

        tracing::info!(address = %addr, "HTTPS server stopped");
        Ok(())
    }
}

/// Build the Axum router with all middleware layers.
#[allow(deprecated)]
pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/alive", get(alive))
        .route("/ready", get(ready))
        .fallback(proxy_handler)
        .with_state(state)
        .layer(TimeoutLayer::new(request_timeout))
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
}

/// True when a registered key claims the request host.
///
/// Health paths on such hosts belong to the backend, not the proxy.
fn claimed_by_backend(state: &AppState, request: &Request<Body>) -> bool {
    state.is_ready()
        && matches!(
            state.routes.load().resolve(&request_host(request)),
            RouteMatch::Matched(_)
        )
}

async fn alive(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    if claimed_by_backend(&state, &request) {
        return proxy_handler(State(state), request).await;
    }
    StatusCode::OK.into_response()
}

async fn ready(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    if claimed_by_backend(&state, &request) {
        return proxy_handler(State(state), request).await;
    }
    if state.is_ready() {
        return StatusCode::OK.into_response();
    }
    let host = request_host(&request);
    unavailable_response(
        &state.pages,
        &state.assets,
        request.uri().path(),
        "503 Service Unavailable",
        &host,
    )
}

/// Catch-all handler: resolve the host and forward.
async fn proxy_handler(State(state): State<AppState>, request: Request<Body>) -> Response<Body> {
    let start = Instant::now();
    let host = request_host(&request);
    let path = request.uri().path().to_string();

    if !state.is_ready() {
        tracing::debug!(host = %host, "Request before first discovery snapshot");
        metrics::record_request(503, "not_ready", start);
        return unavailable_response(
            &state.pages,
            &state.assets,
            &path,
            "503 Service Unavailable",
            &host,
        );
    }

    let table = state.routes.load();
    let route = table.resolve(&host);
    let Some(service) = route.service() else {
        tracing::warn!(
            url = %format!("{}://{}{}", state.scheme, host, request.uri()),
            "Request failed, no matching service found"
        );
        metrics::record_request(502, "no_route", start);
        return failure_response(
            &path,
            StatusCode::BAD_GATEWAY,
            || state.pages.no_route(&host, state.scheme, &table),
            &state.assets,
        );
    };

    let Some(upstream) = service.upstream() else {
        tracing::warn!(host = %host, backend = %service.backend(), "Backend declares no ports");
        metrics::record_request(503, "backend_failure", start);
        return unavailable_response(
            &state.pages,
            &state.assets,
            &path,
            "503 Service Unavailable",
            service.dns_host(),
        );
    };

    forward(&state, upstream, request, start).await
}

/// Send `request` to `upstream` and intercept the result.
pub async fn forward(
    state: &AppState,
    upstream: &Url,
    request: Request<Body>,
    start: Instant,
) -> Response<Body> {
    let host = request_host(&request);
    let path = request.uri().path().to_string();
    let client = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);

    let outbound = match upstream_request(request, upstream, client, state.scheme) {
        Ok(outbound) => outbound,
        Err(e) => {
            tracing::error!(host = %host, upstream = %upstream, error = %e, "Failed to build upstream request");
            metrics::record_request(503, "backend_failure", start);
            return unavailable_response(
                &state.pages,
                &state.assets,
                &path,
                "502 Bad Gateway",
                upstream.as_str(),
            );
        }
    };

    match intercept(state.client.request(outbound).await) {
        Intercepted::Passthrough(response) => {
            metrics::record_request(response.status().as_u16(), "proxied", start);
            passthrough(response)
        }
        failed => {
            let reason = failed.reason().unwrap_or_default();
            let detail = match &failed {
                Intercepted::Failed { detail, .. } => detail.clone(),
                Intercepted::Passthrough(_) => None,
            };
            tracing::info!(
                host = %host,
                upstream = %upstream,
                status = %reason,
                detail = ?detail,
                "Service responded with an error"
            );
            metrics::record_request(503, "backend_failure", start);
            unavailable_response(&state.pages, &state.assets, &path, &reason, upstream.as_str())
        }
    }
}
