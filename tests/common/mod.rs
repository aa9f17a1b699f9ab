//! Shared utilities for integration testing.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use cluster_proxy::discovery::{Backend, PortSpec, Protocol, StaticLister};
use cluster_proxy::proxy::{Proxy, ProxyOptions};

/// Address the proxy binds in tests. Backends live on 127.0.0.1, so the proxy
/// can listen on the same port number a backend serves.
pub const PROXY_IP: IpAddr = IpAddr::V4(Ipv4Addr::new(127, 0, 0, 2));

/// Backend name, namespace and cluster domain joining to `127.0.0.1`.
pub const LOOPBACK_NAME: &str = "127";
pub const LOOPBACK_NAMESPACE: &str = "0";
pub const LOOPBACK_DOMAIN: &str = "0.1";

pub const HOST_LABEL: &str = "cluster-proxy-host";
pub const MANAGEMENT: &str = "cluster-proxy";

/// A port nothing is listening on right now.
pub async fn free_port() -> u16 {
    let taken = TcpListener::bind("127.0.0.1:0").await.unwrap();
    taken.local_addr().unwrap().port()
}

/// Start a mock HTTP backend answering every request with `status` and `body`.
pub async fn start_mock_backend(status: u16, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((mut socket, _)) => {
                    tokio::spawn(async move {
                        read_request_head(&mut socket).await;
                        let status_text = match status {
                            200 => "200 OK",
                            404 => "404 Not Found",
                            500 => "500 Internal Server Error",
                            502 => "502 Bad Gateway",
                            503 => "503 Service Unavailable",
                            _ => "200 OK",
                        };

                        let response = format!(
                            "HTTP/1.1 {}\r\nContent-Length: {}\r\nX-Backend: mock\r\nConnection: close\r\n\r\n{}",
                            status_text,
                            body.len(),
                            body
                        );
                        let _ = socket.write_all(response.as_bytes()).await;
                        let _ = socket.shutdown().await;
                    });
                }
                Err(_) => break,
            }
        }
    });

    addr
}

/// Start a TCP echo server on `127.0.0.1:port`.
pub async fn start_echo_server(port: u16) -> SocketAddr {
    let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });

    addr
}

async fn read_request_head(socket: &mut tokio::net::TcpStream) {
    let mut head = Vec::new();
    let mut buf = [0u8; 1024];
    while !head.windows(4).any(|w| w == b"\r\n\r\n") {
        match socket.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => head.extend_from_slice(&buf[..n]),
        }
    }
}

/// The proxy's own backend, as the control plane reports it.
pub fn management() -> Backend {
    Backend::new(MANAGEMENT, "default").with_port(PortSpec::new(Protocol::Tcp, 80))
}

/// A backend reachable on loopback, routed under `key`.
pub fn loopback_backend(key: &str, port: u16) -> Backend {
    Backend::new(LOOPBACK_NAME, LOOPBACK_NAMESPACE)
        .with_label(HOST_LABEL, key)
        .with_port(PortSpec::new(Protocol::Tcp, port))
}

/// Options for a proxy that binds raw listeners on [`PROXY_IP`].
pub fn proxy_options() -> ProxyOptions {
    ProxyOptions {
        bind_ip: PROXY_IP,
        http_ports: Vec::new(),
        management_service: MANAGEMENT.to_string(),
        reserved_namespaces: vec!["kube-system".to_string()],
        host_label: HOST_LABEL.to_string(),
        default_backend: None,
        cluster_domain: LOOPBACK_DOMAIN.to_string(),
        request_queue_depth: 15,
        watch_interval: Some(Duration::from_millis(50)),
        close_timeout: Duration::from_secs(2),
        stop_timeout: Duration::from_secs(2),
        connect_timeout: Duration::from_secs(2),
    }
}

pub fn build_proxy(lister: Arc<StaticLister>) -> Arc<Proxy> {
    Arc::new(Proxy::new(proxy_options(), lister, CancellationToken::new()))
}

/// Poll `check` until it holds or `timeout` passes.
pub async fn eventually<F, Fut>(timeout: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    check().await
}
