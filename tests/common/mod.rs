// Shared helpers for end-to-end tests

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, TcpListener};
use std::os::fd::RawFd;
use std::time::Duration;

use tcp_acceptor::{Acceptor, Connection, TcpServer};
use tokio::sync::{mpsc, oneshot};

pub const WAIT: Duration = Duration::from_secs(10);

/// What the handler saw for one connection. Owns a reference to the server.
#[derive(Debug)]
pub struct ConnectResult {
    pub server: TcpServer,
    pub port_index: usize,
    pub fd_index: usize,
    pub server_fd: Option<RawFd>,
    pub peer: SocketAddr,
}

/// Handler that forwards every connection's metadata to the returned channel.
pub fn recording_handler() -> (
    impl Fn(Connection, Acceptor) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ConnectResult>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handler = move |connection: Connection, acceptor: Acceptor| {
        let result = ConnectResult {
            server_fd: acceptor.listener_fd(),
            port_index: acceptor.port_index(),
            fd_index: acceptor.fd_index(),
            peer: connection.peer_addr(),
            server: acceptor.into_server(),
        };
        drop(connection);
        let _ = tx.send(result);
    };
    (handler, rx)
}

/// Server plus a receiver that resolves when its shutdown completes.
pub fn server_with_completion(config: tcp_acceptor::ServerConfig) -> (TcpServer, oneshot::Receiver<()>) {
    let (tx, rx) = oneshot::channel();
    let server = TcpServer::create_with_shutdown(config, move || {
        let _ = tx.send(());
    });
    (server, rx)
}

pub async fn wait_for_shutdown(rx: oneshot::Receiver<()>) {
    tokio::time::timeout(WAIT, rx)
        .await
        .expect("shutdown did not complete in time")
        .expect("shutdown notifier dropped without firing");
}

/// Ask the OS for a port nobody is listening on right now.
pub fn pick_unused_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind ephemeral port");
    listener.local_addr().expect("local addr").port()
}

pub fn ipv6_loopback_available() -> bool {
    TcpListener::bind("[::1]:0").is_ok()
}

/// Where to connect to reach a socket bound to `bound`.
pub fn destination(bound: SocketAddr) -> SocketAddr {
    let ip = match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_unspecified() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        ip => ip,
    };
    SocketAddr::new(ip, bound.port())
}

/// Connect to `addr` and wait for the handler to report the connection.
pub async fn tcp_connect(
    addr: SocketAddr,
    results: &mut mpsc::UnboundedReceiver<ConnectResult>,
) -> ConnectResult {
    let client = tokio::time::timeout(WAIT, tokio::net::TcpStream::connect(addr))
        .await
        .expect("connect timed out")
        .expect("connect failed");
    let result = tokio::time::timeout(WAIT, results.recv())
        .await
        .expect("handler was not called in time")
        .expect("handler channel closed");
    assert_eq!(result.peer, client.local_addr().unwrap());
    result
}
