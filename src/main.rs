//! Dynamic cluster reverse proxy.
//!
//! # Architecture Overview
//!
//! ```text
//!   control plane ──▶ discovery::watcher ──ChangeSet──▶ proxy::orchestrator
//!                                                         │          │
//!                                               routing table    listeners (tcp:port)
//!                                                         │          │
//!   client ──▶ http::server (80/443) ──resolve host───────┘          │
//!                 │                                                  │
//!                 ▼                                       dispatch loop (raw TCP)
//!          upstream client ──▶ http::response interceptor            │
//!                 │                     │                            ▼
//!                 ▼                     ▼                     backend relay
//!              backend            error pages (502/503)
//! ```

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;

use cluster_proxy::config::{load_config, Overrides};
use cluster_proxy::discovery::KubeLister;
use cluster_proxy::http::{upstream_client, AppState, Assets, ErrorPages, HttpServer};
use cluster_proxy::lifecycle::{shutdown_on_signal, Shutdown};
use cluster_proxy::net::tls::load_tls_config;
use cluster_proxy::observability::{init_logging, init_metrics};
use cluster_proxy::proxy::{Proxy, ProxyOptions};

#[derive(Debug, Parser)]
#[command(name = "cluster-proxy", version, about = "Dynamic reverse proxy for cluster services")]
struct Cli {
    /// TOML configuration file.
    #[arg(long, env = "PROXY_CONFIG")]
    config: Option<PathBuf>,

    /// Plaintext HTTP port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,

    /// TLS HTTP port.
    #[arg(long = "secure-port", env = "SECUREPORT")]
    secure_port: Option<u16>,

    /// Request timeout in seconds.
    #[arg(long, env = "TIMEOUT")]
    timeout: Option<u64>,

    /// Host key used when no route matches.
    #[arg(long = "default-backend", env = "DEFAULTSVC")]
    default_backend: Option<String>,

    /// Certificate name under the certificate directory.
    #[arg(long = "ssl-cert", env = "SSL_CERT")]
    ssl_cert: Option<String>,

    #[arg(long = "log-level", env = "LOG_LEVEL")]
    log_level: Option<String>,

    /// Development mode: debug logging.
    #[arg(long, env = "DEV")]
    dev: bool,
}

impl Cli {
    fn overrides(&self) -> Overrides {
        Overrides {
            http_port: self.port,
            https_port: self.secure_port,
            request_secs: self.timeout,
            default_backend: self.default_backend.clone(),
            ssl_cert: self.ssl_cert.clone(),
            log_level: self.log_level.clone(),
            dev: self.dev,
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref(), &cli.overrides())
        .context("failed to load configuration")?;

    init_logging(&config.observability);
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "cluster-proxy starting");
    tracing::info!(
        http_port = config.listener.http_port,
        https_port = config.listener.https_port,
        tls = config.listener.tls.is_some(),
        request_timeout_secs = config.timeouts.request_secs,
        default_backend = ?config.discovery.default_backend,
        "Configuration loaded"
    );

    let _ = rustls::crypto::ring::default_provider().install_default();

    if config.observability.metrics_enabled {
        match config.observability.metrics_address.parse::<SocketAddr>() {
            Ok(addr) => {
                if let Err(e) = init_metrics(addr) {
                    tracing::error!(error = %e, "Failed to start metrics endpoint");
                }
            }
            Err(e) => tracing::error!(
                metrics_address = %config.observability.metrics_address,
                error = %e,
                "Failed to parse metrics address"
            ),
        }
    }

    let lister = KubeLister::try_default(config.discovery.namespace.clone())
        .await
        .context("failed to create control plane client")?;
    let pages = ErrorPages::load(config.assets.error_pages_dir.as_deref().map(Path::new))
        .context("failed to compile error page templates")?;
    let assets = Assets::load(&config.assets);

    let shutdown = Shutdown::new();
    let proxy = Arc::new(Proxy::new(
        ProxyOptions::from_config(&config),
        Arc::new(lister),
        shutdown.child_token(),
    ));

    let state = AppState::new(
        &proxy,
        Arc::new(pages),
        Arc::new(assets),
        upstream_client(config.timeouts.connect()),
    );
    let request_timeout = config.timeouts.request();

    let http_addr = SocketAddr::new(config.listener.bind_ip, config.listener.http_port);
    let http_listener = TcpListener::bind(http_addr)
        .await
        .with_context(|| format!("failed to bind {}", http_addr))?;
    let mut servers = Vec::new();
    servers.push(tokio::spawn(
        HttpServer::new(state.clone(), request_timeout).serve(http_listener, shutdown.child_token()),
    ));

    if let Some(tls) = &config.listener.tls {
        let tls_config = load_tls_config(tls)
            .await
            .context("failed to load TLS certificate")?;
        let https_addr = SocketAddr::new(config.listener.bind_ip, config.listener.https_port);
        servers.push(tokio::spawn(
            HttpServer::new(state.secure(), request_timeout).serve_tls(
                https_addr,
                tls_config,
                shutdown.child_token(),
            ),
        ));
    }

    let signals = tokio::spawn(shutdown_on_signal(shutdown.clone()));

    tokio::select! {
        started = proxy.start() => {
            if let Err(e) = started {
                tracing::error!(error = %e, "Proxy failed to start");
                shutdown.trigger();
            }
        }
        _ = shutdown.triggered() => {}
    }

    shutdown.triggered().await;
    if let Err(e) = proxy.stop().await {
        tracing::error!(error = %e, "Proxy shutdown incomplete");
    }

    for server in servers {
        match server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::error!(error = %e, "HTTP server failed"),
            Err(e) => tracing::error!(error = %e, "HTTP server task panicked"),
        }
    }
    signals.abort();

    tracing::info!("Shutdown complete");
    Ok(())
}
