// End-to-end tests for the TCP server: lifecycle, binding and connection
// delivery over real loopback sockets

mod common;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{
    destination, ipv6_loopback_available, pick_unused_port, recording_handler,
    server_with_completion, tcp_connect, wait_for_shutdown, WAIT,
};
use tcp_acceptor::{
    Acceptor, BindStage, Connection, Error, PollingEngine, ServerConfig, ShutdownObserver, TcpServer,
    WeakServer,
};

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_op() {
    let (server, done) = server_with_completion(ServerConfig::default());
    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_op_with_start() {
    let (server, done) = server_with_completion(ServerConfig::default());
    let engine = PollingEngine::current().unwrap();
    server.start(&engine, |_: Connection, _: Acceptor| {}).unwrap();
    assert!(server.is_started());
    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_op_with_port() {
    let (server, done) = server_with_completion(ServerConfig::default());
    let port = server.add_port(addr("0.0.0.0:0")).unwrap();
    assert!(port > 0);
    assert_eq!(server.assigned_port(0), Some(port));
    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_no_op_with_port_and_start() {
    let (server, done) = server_with_completion(ServerConfig::default());
    server.add_port(addr("0.0.0.0:0")).unwrap();
    let engine = PollingEngine::current().unwrap();
    server.start(&engine, |_: Connection, _: Acceptor| {}).unwrap();
    server.unref();
    wait_for_shutdown(done).await;
}

async fn connect_n(connections: usize) {
    let (server, done) = server_with_completion(ServerConfig::default());
    let weak = WeakServer::new();
    weak.set(&server);

    let first = server.add_port(addr("0.0.0.0:0")).unwrap();
    let wanted = pick_unused_port();
    let second = server.add_port(addr(&format!("0.0.0.0:{wanted}"))).unwrap();
    assert!(first > 0);
    assert_eq!(second, wanted);

    // bad indices
    assert_eq!(server.port_fd_count(2), 0);
    assert_eq!(server.port_fd(2, 0), None);
    assert_eq!(server.port_fd(0, 100), None);
    assert_eq!(server.port_fd(1, 100), None);

    let (handler, mut results) = recording_handler();
    let engine = PollingEngine::current().unwrap();
    server.start(&engine, handler).unwrap();

    for port_index in 0..server.port_count() {
        let fd_count = server.port_fd_count(port_index);
        assert!(fd_count >= 1);
        for fd_index in 0..fd_count {
            let fd = server.port_fd(port_index, fd_index);
            assert!(fd.is_some());
            let bound = server.port_addr(port_index, fd_index).unwrap();

            for _ in 0..connections {
                let result = tcp_connect(destination(bound), &mut results).await;
                assert_eq!(result.port_index, port_index);
                assert_eq!(result.fd_index, fd_index);
                assert_eq!(result.server_fd, fd);
                assert_eq!(result.server, server);
            }
        }
    }

    assert!(weak.is_set());
    server.unref();
    wait_for_shutdown(done).await;
    assert!(!weak.is_set());
    assert!(weak.upgrade().is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_single() {
    connect_n(1).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_connect_many() {
    connect_n(10).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_expanded_wildcard_accepts_both_families() {
    if !ipv6_loopback_available() {
        return;
    }
    let (server, done) = server_with_completion(ServerConfig::default().with_expand_wildcard_addrs(true));
    let port = server.add_port(addr("0.0.0.0:0")).unwrap();
    assert_eq!(server.port_fd_count(0), 2);
    assert_eq!(server.port_addr(0, 0), Some(addr(&format!("0.0.0.0:{port}"))));
    assert_eq!(server.port_addr(0, 1), Some(addr(&format!("[::]:{port}"))));

    let (handler, mut results) = recording_handler();
    server.start(&PollingEngine::current().unwrap(), handler).unwrap();

    let v4 = tcp_connect(addr(&format!("127.0.0.1:{port}")), &mut results).await;
    let v6 = tcp_connect(addr(&format!("[::1]:{port}")), &mut results).await;
    assert_eq!(v4.port_index, 0);
    assert_eq!(v6.port_index, 0);
    assert_ne!(v4.fd_index, v6.fd_index);
    drop((v4, v6));

    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_two_listeners_share_a_port() {
    let (server, done) = server_with_completion(ServerConfig::default());
    let port = server.add_port(addr("127.0.0.1:0")).unwrap();
    let again = server.add_port(addr(&format!("127.0.0.1:{port}"))).unwrap();
    assert_eq!(port, again);
    assert_eq!(server.port_count(), 2);

    let (handler, mut results) = recording_handler();
    server.start(&PollingEngine::current().unwrap(), handler).unwrap();

    // the kernel picks which listener gets each connection
    let result = tcp_connect(addr(&format!("127.0.0.1:{port}")), &mut results).await;
    assert!(result.port_index < 2);
    drop(result);

    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_bind_failure_leaves_server_usable() {
    let server = TcpServer::create(ServerConfig::default());

    // TEST-NET-1 is never a local address
    let err = server.add_port(addr("192.0.2.1:0")).unwrap_err();
    assert!(matches!(
        err,
        Error::Bind {
            stage: BindStage::Bind,
            ..
        }
    ));
    assert_eq!(server.port_count(), 0);

    let port = server.add_port(addr("127.0.0.1:0")).unwrap();
    assert_eq!(server.port_count(), 1);
    assert_eq!(server.assigned_port(0), Some(port));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_lifecycle_errors() {
    let server = TcpServer::create(ServerConfig::default());
    let engine = PollingEngine::current().unwrap();
    server.start(&engine, |_: Connection, _: Acceptor| {}).unwrap();

    assert!(matches!(server.add_port(addr("127.0.0.1:0")), Err(Error::AlreadyStarted)));
    assert!(matches!(
        server.start(&engine, |_: Connection, _: Acceptor| {}),
        Err(Error::AlreadyStarted)
    ));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_shutdown_listeners_stops_accepting() {
    let (server, mut done) = server_with_completion(ServerConfig::default());
    let port = server.add_port(addr("127.0.0.1:0")).unwrap();
    server.start(&PollingEngine::current().unwrap(), |_: Connection, _: Acceptor| {}).unwrap();

    server.shutdown_listeners();
    assert_eq!(server.port_fd(0, 0), None);
    assert_eq!(server.port_addr(0, 0), None);

    // the socket goes away once its accept loop notices
    let target = addr(&format!("127.0.0.1:{port}"));
    tokio::time::timeout(WAIT, async {
        while tokio::net::TcpStream::connect(target).await.is_ok() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listening socket was never closed");

    // the server itself is still alive
    assert!(done.try_recv().is_err());
    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_observers_fire_on_last_unref() {
    let fired = Arc::new(AtomicUsize::new(0));
    let (server, done) = server_with_completion(ServerConfig::default());
    for _ in 0..3 {
        let fired = Arc::clone(&fired);
        server.shutdown_starting_add(ShutdownObserver::new(move || {
            fired.fetch_add(1, Ordering::SeqCst);
        }));
    }
    server.add_port(addr("127.0.0.1:0")).unwrap();
    server.start(&PollingEngine::current().unwrap(), |_: Connection, _: Acceptor| {}).unwrap();

    let extra = server.add_ref();
    server.unref();
    assert_eq!(fired.load(Ordering::SeqCst), 0);

    extra.unref();
    assert_eq!(fired.load(Ordering::SeqCst), 3);
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_held_acceptor_delays_shutdown() {
    let (server, mut done) = server_with_completion(ServerConfig::default());
    let port = server.add_port(addr("127.0.0.1:0")).unwrap();
    let (handler, mut results) = recording_handler();
    server.start(&PollingEngine::current().unwrap(), handler).unwrap();

    let result = tcp_connect(addr(&format!("127.0.0.1:{port}")), &mut results).await;
    server.unref();

    // the handler's reference keeps the server and its sockets alive
    assert_eq!(result.server.ref_count(), 1);
    assert!(result.server.port_fd(0, 0).is_some());
    assert!(done.try_recv().is_err());

    result.server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sequential_connections_in_order() {
    let (server, done) = server_with_completion(ServerConfig::default());
    let port = server.add_port(addr("127.0.0.1:0")).unwrap();

    let count = Arc::new(AtomicUsize::new(0));
    let seen = Arc::clone(&count);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let handler = move |connection: Connection, acceptor: Acceptor| {
        let n = seen.fetch_add(1, Ordering::SeqCst);
        drop(acceptor);
        let _ = tx.send((n, connection.peer_addr()));
    };
    server.start(&PollingEngine::current().unwrap(), handler).unwrap();

    let target = addr(&format!("127.0.0.1:{port}"));
    for expected in 0..10 {
        let client = tokio::net::TcpStream::connect(target).await.unwrap();
        let (n, peer) = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(n, expected);
        assert_eq!(peer, client.local_addr().unwrap());
    }
    assert_eq!(count.load(Ordering::SeqCst), 10);

    server.unref();
    wait_for_shutdown(done).await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_failed_sibling_closes_bound_primary() {
    if !ipv6_loopback_available() {
        return;
    }
    // hold the IPv4 wildcard so only the sibling bind can fail
    let held = std::net::TcpListener::bind("0.0.0.0:0").unwrap();
    let port = held.local_addr().unwrap().port();

    let server = TcpServer::create(ServerConfig {
        reuse_port: false,
        expand_wildcard_addrs: true,
        ..ServerConfig::default()
    });
    let err = server.add_port(addr(&format!("[::]:{port}"))).unwrap_err();
    assert!(matches!(
        err,
        Error::Bind {
            stage: BindStage::Bind,
            ..
        }
    ));
    assert_eq!(err.raw_os_error(), Some(libc::EADDRINUSE));
    assert_eq!(server.port_count(), 0);

    // the IPv6 primary bound before the failure and must be gone again
    let rebound = std::net::TcpListener::bind(addr(&format!("[::1]:{port}")));
    assert!(rebound.is_ok(), "primary socket still open: {rebound:?}");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_panicking_handler_closes_listeners() {
    let server = TcpServer::create(ServerConfig::default());
    let port = server.add_port(addr("127.0.0.1:0")).unwrap();
    server
        .start(&PollingEngine::current().unwrap(), |_: Connection, _: Acceptor| {
            panic!("handler failed");
        })
        .unwrap();

    // the first connection kills the dispatcher, a later accept finds it gone
    let target = addr(&format!("127.0.0.1:{port}"));
    tokio::time::timeout(WAIT, async {
        while server.port_fd(0, 0).is_some() {
            let _ = tokio::net::TcpStream::connect(target).await;
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("listening socket stayed open after the handler panicked");
}
