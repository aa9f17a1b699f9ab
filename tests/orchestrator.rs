//! Orchestrator lifecycle against an in-memory control plane.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use cluster_proxy::discovery::{Protocol, StaticLister};
use cluster_proxy::net::{ListenerKey, ListenerStatus};
use cluster_proxy::proxy::ErrorKind;

mod common;

#[tokio::test]
async fn first_snapshot_builds_routes_and_listeners() {
    let port = common::free_port().await;
    let lister = Arc::new(StaticLister::new(vec![
        common::management(),
        common::loopback_backend("foo", port),
    ]));
    let proxy = common::build_proxy(Arc::clone(&lister));

    proxy.start().await.unwrap();
    assert!(proxy.is_ready());

    let table = proxy.routes().load();
    assert!(table.contains("foo"));
    assert!(!table.contains(common::MANAGEMENT));

    let key = ListenerKey::new(Protocol::Tcp, port);
    assert_eq!(proxy.listener_status(&key).await, Some(ListenerStatus::Listening));

    // the management backend now advertises the new port
    let updates = lister.updates();
    let declared = updates.last().expect("management backend updated");
    assert_eq!(declared.name, common::MANAGEMENT);
    assert!(declared.ports.iter().any(|p| p.port == port));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn removal_drops_route_but_keeps_listener() {
    let port = common::free_port().await;
    let lister = Arc::new(StaticLister::new(vec![
        common::management(),
        common::loopback_backend("foo", port),
    ]));
    let proxy = common::build_proxy(Arc::clone(&lister));
    proxy.start().await.unwrap();

    lister.set_backends(vec![common::management()]);
    let routes = proxy.routes();
    let removed = common::eventually(Duration::from_secs(2), || {
        let routes = Arc::clone(&routes);
        async move { !routes.load().contains("foo") }
    })
    .await;
    assert!(removed, "foo should disappear after the next poll");

    let key = ListenerKey::new(Protocol::Tcp, port);
    assert_eq!(proxy.listener_status(&key).await, Some(ListenerStatus::Listening));

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn backends_in_reserved_namespaces_are_ignored() {
    let system = cluster_proxy::discovery::Backend::new("dns", "kube-system");
    let lister = Arc::new(StaticLister::new(vec![common::management(), system.clone()]));
    let proxy = common::build_proxy(lister);
    proxy.start().await.unwrap();

    assert!(!proxy.routes().load().contains("dns"));
    let err = proxy.add_backend(system).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Reserved);

    proxy.stop().await.unwrap();
}

#[tokio::test]
async fn stop_is_bounded_and_final() {
    let port = common::free_port().await;
    let lister = Arc::new(StaticLister::new(vec![common::loopback_backend("foo", port)]));
    let proxy = common::build_proxy(Arc::clone(&lister));
    proxy.start().await.unwrap();

    let started = Instant::now();
    proxy.stop().await.unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!proxy.is_ready());
    assert!(proxy.listener_keys().await.is_empty());

    let err = proxy
        .add_backend(common::loopback_backend("bar", port))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Shutdown);
    assert!(proxy.start().await.is_err());
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn raw_tcp_is_relayed_to_backend() {
    let port = common::free_port().await;
    common::start_echo_server(port).await;

    let lister = Arc::new(StaticLister::new(vec![common::loopback_backend("echo", port)]));
    let proxy = common::build_proxy(lister);
    proxy.start().await.unwrap();

    let mut client = TcpStream::connect((common::PROXY_IP, port)).await.unwrap();
    client.write_all(b"ping over the proxy").await.unwrap();

    let mut echoed = vec![0u8; "ping over the proxy".len()];
    tokio::time::timeout(Duration::from_secs(5), client.read_exact(&mut echoed))
        .await
        .expect("echo within timeout")
        .unwrap();
    assert_eq!(&echoed[..], b"ping over the proxy");

    drop(client);
    proxy.stop().await.unwrap();
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn stop_ends_active_relays() {
    let port = common::free_port().await;
    common::start_echo_server(port).await;

    let lister = Arc::new(StaticLister::new(vec![common::loopback_backend("echo", port)]));
    let proxy = common::build_proxy(lister);
    proxy.start().await.unwrap();

    let mut client = TcpStream::connect((common::PROXY_IP, port)).await.unwrap();
    client.write_all(b"hold").await.unwrap();
    let mut echoed = [0u8; 4];
    client.read_exact(&mut echoed).await.unwrap();

    proxy.stop().await.unwrap();

    // the relay is gone, so the idle client sees end of stream
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(Duration::from_secs(2), client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "client connection should close when the proxy stops");
    assert!(rest.is_empty());
}
