// Accept loop module
// Drains one listening socket on every readiness notification and hands each
// connection to the dispatcher

use std::io;
use std::sync::{Arc, Weak};
use std::time::Duration;

use socket2::{SockAddr, Socket};
use tokio::io::unix::{AsyncFd, AsyncFdReadyGuard};
use tokio::sync::mpsc::UnboundedSender;

use super::connection::{Acceptor, Connection, Dispatch};
use super::listener::SocketEndpoint;
use super::shutdown::{ShutdownComplete, ShutdownSignal};
use super::{ServerInner, TcpServer};
use crate::error::Error;
use crate::logger;
use crate::poller::PollingEngine;

/// How an `accept()` failure affects the loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AcceptFailure {
    /// The pending connection died before we took it; try the next one
    Connection,
    /// Out of descriptors or memory; back off before accepting again
    Exhausted,
    /// The listening socket itself is unusable
    Fatal,
}

/// Classify an `accept()` error.
///
/// Linux reports network errors of the half-open connection through
/// `accept()`; those are per-connection, like `ECONNABORTED`.
pub(crate) fn classify(err: &io::Error) -> AcceptFailure {
    if matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    ) {
        return AcceptFailure::Connection;
    }
    match err.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => AcceptFailure::Exhausted,
        Some(
            libc::EPROTO
            | libc::EPERM
            | libc::ENETDOWN
            | libc::ENOPROTOOPT
            | libc::EHOSTDOWN
            | libc::ENONET
            | libc::EHOSTUNREACH
            | libc::ENETUNREACH
            | libc::ETIMEDOUT,
        ) => AcceptFailure::Connection,
        _ => AcceptFailure::Fatal,
    }
}

/// Result of draining one readiness notification.
enum Burst {
    /// The socket reported would-block; wait for the next notification
    Drained,
    Exhausted,
    Shutdown,
    Failed(io::Error),
}

enum Exit {
    Shutdown,
    Failed(io::Error),
}

/// Accept loop bound to exactly one listening socket.
pub(crate) struct AcceptLoop {
    pub(crate) endpoint: Arc<SocketEndpoint>,
    pub(crate) registration: AsyncFd<Socket>,
    pub(crate) server: Weak<ServerInner>,
    pub(crate) shutdown: Arc<ShutdownSignal>,
    pub(crate) dispatch: UnboundedSender<Dispatch>,
    pub(crate) tcp_nodelay: bool,
    pub(crate) backoff: Duration,
    pub(crate) complete: Arc<ShutdownComplete>,
}

impl AcceptLoop {
    /// Accept until shutdown or a fatal socket error, then close the socket.
    pub(crate) async fn run(self) {
        let exit = self.serve().await;
        self.close(exit);
    }

    async fn serve(&self) -> Exit {
        loop {
            let burst = {
                let mut guard = tokio::select! {
                    biased;
                    () = self.shutdown.wait() => return Exit::Shutdown,
                    ready = self.registration.readable() => match ready {
                        Ok(guard) => guard,
                        Err(e) => return Exit::Failed(e),
                    },
                };
                self.drain(&mut guard)
            };

            match burst {
                Burst::Drained => {}
                Burst::Exhausted => {
                    if !self.pause().await {
                        return Exit::Shutdown;
                    }
                }
                Burst::Shutdown => return Exit::Shutdown,
                Burst::Failed(e) => return Exit::Failed(e),
            }
        }
    }

    /// Accept every pending connection behind one readiness notification.
    fn drain(&self, guard: &mut AsyncFdReadyGuard<'_, Socket>) -> Burst {
        loop {
            if self.shutdown.is_triggered() {
                return Burst::Shutdown;
            }
            match guard.try_io(|registration| registration.get_ref().accept()) {
                // would block: readiness is cleared, nothing left pending
                Err(_) => return Burst::Drained,
                Ok(Ok((socket, peer))) => {
                    if !self.hand_off(socket, &peer) {
                        return Burst::Shutdown;
                    }
                }
                Ok(Err(e)) => match classify(&e) {
                    AcceptFailure::Connection => {
                        logger::log_accept_error(self.endpoint.port_index, self.endpoint.fd_index, &e);
                    }
                    AcceptFailure::Exhausted => {
                        logger::log_accept_backoff(
                            self.endpoint.port_index,
                            self.endpoint.fd_index,
                            &e,
                            u64::try_from(self.backoff.as_millis()).unwrap_or(u64::MAX),
                        );
                        return Burst::Exhausted;
                    }
                    AcceptFailure::Fatal => return Burst::Failed(e),
                },
            }
        }
    }

    /// Pair the connection with a fresh acceptor and queue it for the
    /// handler. Returns false once the server is gone.
    fn hand_off(&self, socket: Socket, peer: &SockAddr) -> bool {
        let Some(inner) = self.server.upgrade() else {
            return false;
        };
        let server = TcpServer { inner };
        let (port_index, fd_index) = (self.endpoint.port_index, self.endpoint.fd_index);

        let connection = match Connection::from_accepted(socket, peer, self.tcp_nodelay) {
            Ok(connection) => connection,
            Err(e) => {
                logger::log_accept_error(port_index, fd_index, &e);
                return true;
            }
        };
        logger::log_connection_accepted(port_index, fd_index, &connection.peer_addr());

        let acceptor = Acceptor::new(server, port_index, fd_index);
        if self
            .dispatch
            .send(Dispatch::Connected(connection, acceptor))
            .is_err()
        {
            // the dispatcher only exits early when the handler panicked
            logger::log_dispatcher_gone(port_index, fd_index);
            return false;
        }
        true
    }

    /// Sleep out the backoff. Returns false if shutdown arrived first.
    async fn pause(&self) -> bool {
        tokio::select! {
            biased;
            () = self.shutdown.wait() => false,
            () = tokio::time::sleep(self.backoff) => true,
        }
    }

    fn close(self, exit: Exit) {
        let Self {
            endpoint,
            registration,
            dispatch,
            complete,
            ..
        } = self;

        endpoint.mark_closed();
        drop(PollingEngine::deregister(registration));

        match exit {
            Exit::Shutdown => {
                logger::log_endpoint_closed(endpoint.port_index, endpoint.fd_index, &endpoint.bound_addr);
            }
            Exit::Failed(source) => {
                logger::log_endpoint_failed(endpoint.port_index, endpoint.fd_index, &source);
                let _ = dispatch.send(Dispatch::Failed(Error::Endpoint {
                    port_index: endpoint.port_index,
                    fd_index: endpoint.fd_index,
                    source,
                }));
            }
        }

        drop(dispatch);
        drop(complete);
    }
}
