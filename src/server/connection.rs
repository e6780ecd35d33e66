// Connection hand-off module
// Accepted connections, their acceptor metadata, and the deferred dispatcher
// that delivers them to the registered handler

use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::Arc;

use socket2::{SockAddr, Socket};
use tokio::sync::mpsc::UnboundedReceiver;

use super::shutdown::ShutdownComplete;
use super::TcpServer;
use crate::error::Error;

/// An accepted, connected socket ready for the transport layer.
pub struct Connection {
    stream: TcpStream,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
}

impl Connection {
    /// Wrap a freshly accepted socket: non-blocking, optional `TCP_NODELAY`.
    pub(crate) fn from_accepted(socket: Socket, peer: &SockAddr, nodelay: bool) -> io::Result<Self> {
        socket.set_nonblocking(true)?;
        let stream: TcpStream = socket.into();
        if nodelay {
            stream.set_nodelay(true)?;
        }
        let peer_addr = match peer.as_socket() {
            Some(addr) => addr,
            None => stream.peer_addr()?,
        };
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            peer_addr,
            local_addr,
        })
    }

    pub const fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn into_std(self) -> TcpStream {
        self.stream
    }

    /// Register the connection with the current tokio runtime.
    pub fn into_tokio(self) -> io::Result<tokio::net::TcpStream> {
        tokio::net::TcpStream::from_std(self.stream)
    }
}

impl AsRawFd for Connection {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("fd", &self.as_raw_fd())
            .field("peer_addr", &self.peer_addr)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

/// Which listener and socket produced a connection, plus a strong reference
/// that keeps the server alive until the handler is done with it.
#[derive(Debug)]
pub struct Acceptor {
    server: TcpServer,
    port_index: usize,
    fd_index: usize,
}

impl Acceptor {
    pub(crate) const fn new(server: TcpServer, port_index: usize, fd_index: usize) -> Self {
        Self {
            server,
            port_index,
            fd_index,
        }
    }

    pub const fn server(&self) -> &TcpServer {
        &self.server
    }

    pub const fn port_index(&self) -> usize {
        self.port_index
    }

    pub const fn fd_index(&self) -> usize {
        self.fd_index
    }

    /// Descriptor of the listening socket the connection arrived on.
    pub fn listener_fd(&self) -> Option<RawFd> {
        self.server.port_fd(self.port_index, self.fd_index)
    }

    /// Keep the server reference beyond the acceptor.
    pub fn into_server(self) -> TcpServer {
        self.server
    }
}

/// Receiver of accepted connections.
///
/// Called from the polling engine's workers, never from inside a readiness
/// handler. The handler owns the connection and the acceptor's server
/// reference once called. A handler that stores a `TcpServer` keeps that
/// server alive for as long as the handler itself lives.
///
/// One task makes every call for a server, in arrival order, so a slow call
/// delays connections from all of its listeners while accepted connections
/// queue up behind it. Hand long work off to a spawned task.
///
/// If a call panics, the server stops delivering: queued connections are
/// dropped and each accept loop closes its socket, with a warning, the next
/// time it accepts.
pub trait ConnectHandler: Send + Sync + 'static {
    fn on_connect(&self, connection: Connection, acceptor: Acceptor);

    /// A listening socket failed and its accept loop stopped. Sibling
    /// sockets keep accepting. The failure has already been logged.
    fn on_endpoint_error(&self, error: Error) {
        let _ = error;
    }
}

impl<F> ConnectHandler for F
where
    F: Fn(Connection, Acceptor) + Send + Sync + 'static,
{
    fn on_connect(&self, connection: Connection, acceptor: Acceptor) {
        self(connection, acceptor);
    }
}

/// Message from an accept loop to the dispatcher.
pub(crate) enum Dispatch {
    Connected(Connection, Acceptor),
    Failed(Error),
}

/// Deliver dispatches to the handler in arrival order until every accept
/// loop has hung up.
pub(crate) async fn dispatch_loop(
    mut rx: UnboundedReceiver<Dispatch>,
    handler: Arc<dyn ConnectHandler>,
    _complete: Arc<ShutdownComplete>,
) {
    while let Some(dispatch) = rx.recv().await {
        match dispatch {
            Dispatch::Connected(connection, acceptor) => handler.on_connect(connection, acceptor),
            Dispatch::Failed(error) => handler.on_endpoint_error(error),
        }
    }
}
