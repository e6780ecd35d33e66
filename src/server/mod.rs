// Server module entry point
// The reference-counted TCP server: port binding, start, shutdown and
// descriptor introspection

mod accept;
pub mod connection;
pub mod listener;
pub mod shutdown;

use std::fmt;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use tokio::sync::mpsc;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::logger;
use crate::poller::PollingEngine;
use accept::AcceptLoop;
use listener::{Listener, SocketEndpoint};
use shutdown::{ShutdownComplete, ShutdownSignal};

// Re-export public types
pub use connection::{Acceptor, ConnectHandler, Connection};
pub use listener::{plan_binds, BindRequest};
pub use shutdown::{ShutdownObserver, WeakServer};

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Listener table. Grows only before `start`.
#[derive(Debug, Default)]
struct ServerState {
    listeners: Vec<Listener>,
    started: bool,
}

impl ServerState {
    fn endpoint(&self, port_index: usize, fd_index: usize) -> Option<&Arc<SocketEndpoint>> {
        self.listeners.get(port_index)?.endpoints.get(fd_index)
    }

    fn endpoints(&self) -> impl Iterator<Item = &Arc<SocketEndpoint>> {
        self.listeners.iter().flat_map(|l| l.endpoints.iter())
    }
}

pub(crate) struct ServerInner {
    config: ServerConfig,
    state: RwLock<ServerState>,
    observers: Mutex<Vec<ShutdownObserver>>,
    shutdown: Arc<ShutdownSignal>,
    /// Listening sockets are closed or closing
    closed: AtomicBool,
    complete: Arc<ShutdownComplete>,
}

impl ServerInner {
    /// Stop every accept loop and close sockets no loop owns yet. Idempotent.
    fn close_listeners(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shutdown.trigger();
        for endpoint in read(&self.state).endpoints() {
            endpoint.close();
        }
    }
}

impl Drop for ServerInner {
    fn drop(&mut self) {
        let observers = std::mem::take(
            self.observers
                .get_mut()
                .unwrap_or_else(PoisonError::into_inner),
        );
        logger::log_shutdown_starting(observers.len());
        for observer in observers {
            observer.notify();
        }
        self.close_listeners();
    }
}

/// A strong reference to a reference-counted TCP server.
///
/// Every `TcpServer` value is one reference: [`add_ref`](Self::add_ref) (or
/// `clone`) takes another, [`unref`](Self::unref) (or dropping) releases it.
/// When the last one goes, shutdown observers fire, listening sockets close,
/// and once every accept loop has exited the shutdown-complete callback runs.
pub struct TcpServer {
    pub(crate) inner: Arc<ServerInner>,
}

impl TcpServer {
    pub fn create(config: ServerConfig) -> Self {
        Self::build(config, None)
    }

    /// Create a server whose `on_shutdown_complete` runs once after the
    /// server is gone and no socket remains registered with the engine.
    pub fn create_with_shutdown(
        config: ServerConfig,
        on_shutdown_complete: impl FnOnce() + Send + 'static,
    ) -> Self {
        Self::build(config, Some(Box::new(on_shutdown_complete)))
    }

    fn build(config: ServerConfig, on_complete: Option<Box<dyn FnOnce() + Send>>) -> Self {
        logger::log_server_created(&config);
        Self {
            inner: Arc::new(ServerInner {
                config,
                state: RwLock::new(ServerState::default()),
                observers: Mutex::new(Vec::new()),
                shutdown: Arc::new(ShutdownSignal::default()),
                closed: AtomicBool::new(false),
                complete: ShutdownComplete::new(on_complete),
            }),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    /// Bind `addr` and return the port it ended up on.
    ///
    /// Port 0 asks the OS for a free port. A wildcard address with
    /// `expand_wildcard_addrs` also binds the other family's wildcard on the
    /// same port. On failure nothing from this call stays open or registered.
    pub fn add_port(&self, addr: SocketAddr) -> Result<u16> {
        let mut state = write(&self.inner.state);
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        let port_index = state.listeners.len();
        let prior_port = state.listeners.first().map(|l| l.assigned_port);
        let listener = match Listener::bind(port_index, addr, &self.inner.config, prior_port) {
            Ok(listener) => listener,
            Err(e) => {
                logger::log_bind_failed(&addr, &e);
                return Err(e);
            }
        };

        let port = listener.assigned_port;
        logger::log_port_added(
            listener.port_index,
            &listener.requested,
            port,
            &listener.bound_addrs(),
        );
        state.listeners.push(listener);
        Ok(port)
    }

    /// Register every socket with `engine` and start accepting.
    ///
    /// Connections reach `handler` in acceptance order per socket. Valid with
    /// no ports added; such a server simply never connects anything.
    pub fn start(&self, engine: &PollingEngine, handler: impl ConnectHandler) -> Result<()> {
        let mut state = write(&self.inner.state);
        if state.started {
            return Err(Error::AlreadyStarted);
        }
        if self.inner.closed.load(Ordering::Acquire) {
            return Err(Error::ShutDown);
        }

        // Register everything first so a failure leaves the server unstarted.
        let mut registered = Vec::new();
        for endpoint in state.endpoints() {
            let Some(socket) = endpoint.take_socket() else {
                continue;
            };
            match engine.register(socket) {
                Ok(registration) => registered.push((Arc::clone(endpoint), registration)),
                Err((socket, source)) => {
                    endpoint.restore_socket(socket);
                    for (endpoint, registration) in registered {
                        endpoint.restore_socket(PollingEngine::deregister(registration));
                    }
                    return Err(Error::Register {
                        addr: endpoint.bound_addr,
                        source,
                    });
                }
            }
        }
        state.started = true;

        let (tx, rx) = mpsc::unbounded_channel();
        let handler: Arc<dyn ConnectHandler> = Arc::new(handler);
        engine.run(connection::dispatch_loop(
            rx,
            handler,
            Arc::clone(&self.inner.complete),
        ));

        let endpoints = registered.len();
        for (endpoint, registration) in registered {
            let accept_loop = AcceptLoop {
                endpoint,
                registration,
                server: Arc::downgrade(&self.inner),
                shutdown: Arc::clone(&self.inner.shutdown),
                dispatch: tx.clone(),
                tcp_nodelay: self.inner.config.tcp_nodelay,
                backoff: Duration::from_millis(self.inner.config.accept_backoff_ms),
                complete: Arc::clone(&self.inner.complete),
            };
            engine.run(accept_loop.run());
        }

        logger::log_server_started(state.listeners.len(), endpoints);
        Ok(())
    }

    /// Take another strong reference.
    #[must_use]
    pub fn add_ref(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Release this reference; the last one shuts the server down.
    pub fn unref(self) {
        drop(self);
    }

    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Register `observer` to run when shutdown begins. Does not keep the
    /// server alive.
    pub fn shutdown_starting_add(&self, observer: ShutdownObserver) {
        lock(&self.inner.observers).push(observer);
    }

    /// Close every listening socket now, without waiting for the last
    /// reference. Connections already queued for the handler still arrive.
    pub fn shutdown_listeners(&self) {
        self.inner.close_listeners();
    }

    pub fn is_started(&self) -> bool {
        read(&self.inner.state).started
    }

    /// Number of listeners added so far.
    pub fn port_count(&self) -> usize {
        read(&self.inner.state).listeners.len()
    }

    /// Number of sockets under listener `port_index`; 0 if there is none.
    pub fn port_fd_count(&self, port_index: usize) -> usize {
        read(&self.inner.state)
            .listeners
            .get(port_index)
            .map_or(0, |l| l.endpoints.len())
    }

    /// Descriptor of socket `fd_index` under listener `port_index`, or
    /// `None` when either index is out of range or the socket is closed.
    pub fn port_fd(&self, port_index: usize, fd_index: usize) -> Option<RawFd> {
        read(&self.inner.state)
            .endpoint(port_index, fd_index)
            .and_then(|e| e.fd())
    }

    /// Address socket `fd_index` under listener `port_index` is bound to.
    pub fn port_addr(&self, port_index: usize, fd_index: usize) -> Option<SocketAddr> {
        read(&self.inner.state)
            .endpoint(port_index, fd_index)
            .filter(|e| e.is_open())
            .map(|e| e.bound_addr)
    }

    pub fn assigned_port(&self, port_index: usize) -> Option<u16> {
        read(&self.inner.state)
            .listeners
            .get(port_index)
            .map(|l| l.assigned_port)
    }
}

impl Clone for TcpServer {
    fn clone(&self) -> Self {
        self.add_ref()
    }
}

/// Two references are equal when they point at the same server.
impl PartialEq for TcpServer {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for TcpServer {}

impl fmt::Debug for TcpServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = read(&self.inner.state);
        f.debug_struct("TcpServer")
            .field("listeners", &state.listeners.len())
            .field("started", &state.started)
            .field("refs", &self.ref_count())
            .finish_non_exhaustive()
    }
}
