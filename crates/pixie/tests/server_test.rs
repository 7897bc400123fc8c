//! Integration tests for the server runtime lifecycle.

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use pixie::{BootSpec, Config, Id, Server, StaticBooter};

fn free_udp_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
    socket.local_addr().unwrap().port()
}

fn free_tcp_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn test_config() -> Config {
    let booter = StaticBooter::new(BootSpec {
        kernel: Id::from("/boot/vmlinuz"),
        ..BootSpec::default()
    })
    .unwrap();

    let mut config = Config::new(Arc::new(booter));
    config.address = Ipv4Addr::LOCALHOST;
    config.http_port = free_tcp_port();
    config.dhcp_port = free_udp_port();
    config.tftp_port = free_udp_port();
    config.pxe_port = free_udp_port();
    config
}

#[tokio::test]
async fn shutdown_before_serve_returns_immediately() {
    let server = Server::new(test_config());
    server.shutdown_handle().shutdown();
    assert!(server.serve().await.is_ok());
}

#[tokio::test]
async fn shutdown_while_serving_unwinds_cleanly() {
    let server = Server::new(test_config());
    let handle = server.shutdown_handle();

    let serving = tokio::spawn(server.serve());
    tokio::time::sleep(Duration::from_millis(100)).await;
    handle.shutdown();

    let result = tokio::time::timeout(Duration::from_secs(5), serving)
        .await
        .expect("serve did not exit after shutdown")
        .expect("serve task panicked");
    assert!(result.is_ok());
}

#[tokio::test]
async fn shutdown_is_idempotent() {
    let server = Server::new(test_config());
    let handle = server.shutdown_handle();
    for _ in 0..10 {
        handle.shutdown();
    }
    assert!(server.serve().await.is_ok());
}

#[tokio::test]
async fn bind_conflict_is_a_startup_error() {
    let mut config = test_config();
    // Occupy the HTTP port so the bind fails.
    let blocker = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
    config.http_port = blocker.local_addr().unwrap().port();

    let server = Server::new(config);
    assert!(server.serve().await.is_err());
}

#[tokio::test]
async fn unspecified_address_is_rejected() {
    let mut config = test_config();
    config.address = Ipv4Addr::UNSPECIFIED;
    assert!(Server::new(config).serve().await.is_err());
}
