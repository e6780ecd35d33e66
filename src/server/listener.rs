// Listener module
// Turns one requested address into bound, listening sockets that share a port

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use socket2::{Domain, Protocol, Socket, Type};

use super::lock;
use crate::config::ServerConfig;
use crate::error::{BindStage, Error, Result};
use crate::logger;

/// One concrete socket to create for an `add_port` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindRequest {
    pub addr: SocketAddr,
    /// Set `IPV6_V6ONLY` so the socket does not also claim IPv4
    pub only_v6: bool,
    /// Created by wildcard expansion rather than asked for directly
    pub sibling: bool,
}

/// Decide which sockets an `add_port(addr)` call creates.
///
/// Pure: no sockets are touched. `prior_port` is the port of an earlier
/// listener to inherit when the request is for port 0 and sharing is enabled.
/// The requested family always comes first.
pub fn plan_binds(
    addr: SocketAddr,
    config: &ServerConfig,
    prior_port: Option<u16>,
) -> Vec<BindRequest> {
    let mut addr = addr;
    if addr.port() == 0 && config.share_wildcard_port {
        if let Some(port) = prior_port {
            addr.set_port(port);
        }
    }

    if !(config.expand_wildcard_addrs && addr.ip().is_unspecified()) {
        return vec![BindRequest {
            addr,
            only_v6: false,
            sibling: false,
        }];
    }

    let sibling_ip: IpAddr = match addr {
        SocketAddr::V4(_) => Ipv6Addr::UNSPECIFIED.into(),
        SocketAddr::V6(_) => Ipv4Addr::UNSPECIFIED.into(),
    };
    vec![
        BindRequest {
            addr,
            only_v6: addr.is_ipv6(),
            sibling: false,
        },
        BindRequest {
            addr: SocketAddr::new(sibling_ip, addr.port()),
            only_v6: sibling_ip.is_ipv6(),
            sibling: true,
        },
    ]
}

/// One OS-level listening socket.
///
/// The socket is held here until `start` moves it into its accept loop.
#[derive(Debug)]
pub(crate) struct SocketEndpoint {
    pub(crate) port_index: usize,
    pub(crate) fd_index: usize,
    pub(crate) bound_addr: SocketAddr,
    fd: RawFd,
    open: AtomicBool,
    socket: Mutex<Option<Socket>>,
}

impl SocketEndpoint {
    fn new(port_index: usize, fd_index: usize, bound_addr: SocketAddr, socket: Socket) -> Self {
        Self {
            port_index,
            fd_index,
            bound_addr,
            fd: socket.as_raw_fd(),
            open: AtomicBool::new(true),
            socket: Mutex::new(Some(socket)),
        }
    }

    /// Descriptor while the socket is still open.
    pub(crate) fn fd(&self) -> Option<RawFd> {
        self.open.load(Ordering::Acquire).then_some(self.fd)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    pub(crate) fn take_socket(&self) -> Option<Socket> {
        lock(&self.socket).take()
    }

    pub(crate) fn restore_socket(&self, socket: Socket) {
        *lock(&self.socket) = Some(socket);
    }

    /// Close the socket if it was never handed to an accept loop; otherwise
    /// only mark it closed and leave the descriptor to the loop.
    pub(crate) fn close(&self) {
        self.mark_closed();
        drop(self.take_socket());
    }

    pub(crate) fn mark_closed(&self) {
        self.open.store(false, Ordering::Release);
    }
}

/// One user-requested binding, realised as one or more sockets.
#[derive(Debug)]
pub(crate) struct Listener {
    pub(crate) port_index: usize,
    pub(crate) requested: SocketAddr,
    pub(crate) assigned_port: u16,
    pub(crate) endpoints: Vec<Arc<SocketEndpoint>>,
}

impl Listener {
    /// Bind every socket planned for `requested`.
    ///
    /// The first socket fixes the port (asking the OS when it is 0); the rest
    /// are forced onto it. Any failure drops, and so closes, every socket
    /// created by this call.
    pub(crate) fn bind(
        port_index: usize,
        requested: SocketAddr,
        config: &ServerConfig,
        prior_port: Option<u16>,
    ) -> Result<Self> {
        let mut port = 0;
        let mut endpoints: Vec<Arc<SocketEndpoint>> = Vec::new();

        for request in plan_binds(requested, config, prior_port) {
            let mut target = request.addr;
            if port != 0 {
                target.set_port(port);
            }

            let socket = match bind_socket(target, request.only_v6, config) {
                Ok(socket) => socket,
                Err(e) if request.sibling && e.is_family_unavailable() => {
                    logger::log_sibling_skipped(&target, &e);
                    continue;
                }
                Err(e) => return Err(e),
            };
            let bound = local_addr(&socket, target)?;
            if port == 0 {
                port = bound.port();
            }

            let fd_index = endpoints.len();
            endpoints.push(Arc::new(SocketEndpoint::new(
                port_index, fd_index, bound, socket,
            )));
        }

        Ok(Self {
            port_index,
            requested,
            assigned_port: port,
            endpoints,
        })
    }

    pub(crate) fn bound_addrs(&self) -> Vec<SocketAddr> {
        self.endpoints.iter().map(|e| e.bound_addr).collect()
    }
}

fn bind_error(addr: SocketAddr, stage: BindStage) -> impl FnOnce(io::Error) -> Error {
    move |source| Error::Bind {
        addr,
        stage,
        source,
    }
}

/// Create a non-blocking listening socket for `addr` with the configured
/// reuse options.
///
/// `SO_REUSEPORT` lets a later listener bind a port an earlier one holds.
fn bind_socket(addr: SocketAddr, only_v6: bool, config: &ServerConfig) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(bind_error(addr, BindStage::Create))?;

    if only_v6 {
        socket
            .set_only_v6(true)
            .map_err(bind_error(addr, BindStage::SetOption))?;
    }
    if config.reuse_port {
        socket
            .set_reuse_port(true)
            .map_err(bind_error(addr, BindStage::SetOption))?;
    }
    if config.reuse_address {
        socket
            .set_reuse_address(true)
            .map_err(bind_error(addr, BindStage::SetOption))?;
    }
    socket
        .set_nonblocking(true)
        .map_err(bind_error(addr, BindStage::SetOption))?;

    socket
        .bind(&addr.into())
        .map_err(bind_error(addr, BindStage::Bind))?;
    socket
        .listen(config.backlog)
        .map_err(bind_error(addr, BindStage::Listen))?;

    Ok(socket)
}

fn local_addr(socket: &Socket, requested: SocketAddr) -> Result<SocketAddr> {
    let addr = socket
        .local_addr()
        .map_err(bind_error(requested, BindStage::LocalAddr))?;
    addr.as_socket().ok_or_else(|| Error::Bind {
        addr: requested,
        stage: BindStage::LocalAddr,
        source: io::Error::new(io::ErrorKind::InvalidData, "not an inet socket address"),
    })
}
