//! Logger module
//!
//! Provides logging for the acceptor including:
//! - Subscriber initialisation (level filter, chrono timestamps, file target)
//! - Listener lifecycle events
//! - Accept-path errors and endpoint failures

pub mod writer;

use std::io;
use std::net::SocketAddr;

use tracing::{debug, error, info, warn};
use tracing_subscriber::fmt::time::ChronoLocal;
use tracing_subscriber::EnvFilter;

use crate::config::{LoggingConfig, ServerConfig};
use crate::error::Error;
use writer::LogTarget;

const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Initialize the global subscriber with configuration
///
/// Should be called once at application startup. `RUST_LOG` takes precedence
/// over `config.level`.
pub fn init(config: &LoggingConfig) -> io::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e.to_string()))?;
    let target = LogTarget::from_path(config.file.as_deref());

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(ChronoLocal::new(TIME_FORMAT.to_string()))
        .with_ansi(target.is_terminal())
        .with_writer(target.make_writer()?)
        .try_init()
        .map_err(|e| io::Error::new(io::ErrorKind::AlreadyExists, e.to_string()))
}

pub fn log_server_created(config: &ServerConfig) {
    debug!(
        expand_wildcard_addrs = config.expand_wildcard_addrs,
        reuse_port = config.reuse_port,
        backlog = config.backlog,
        "tcp server created"
    );
}

pub fn log_port_added(port_index: usize, requested: &SocketAddr, port: u16, bound: &[SocketAddr]) {
    info!(port_index, %requested, port, endpoints = ?bound, "listener bound");
}

pub fn log_bind_failed(addr: &SocketAddr, err: &Error) {
    error!(%addr, "add_port failed: {err}");
}

pub fn log_sibling_skipped(addr: &SocketAddr, err: &Error) {
    warn!(%addr, "address family unavailable, skipping wildcard sibling: {err}");
}

pub fn log_server_started(listeners: usize, endpoints: usize) {
    info!(listeners, endpoints, "tcp server started");
}

pub fn log_connection_accepted(port_index: usize, fd_index: usize, peer: &SocketAddr) {
    debug!(port_index, fd_index, %peer, "connection accepted");
}

pub fn log_accept_error(port_index: usize, fd_index: usize, err: &io::Error) {
    warn!(port_index, fd_index, "accept failed, continuing: {err}");
}

pub fn log_accept_backoff(port_index: usize, fd_index: usize, err: &io::Error, backoff_ms: u64) {
    error!(port_index, fd_index, backoff_ms, "accept resources exhausted: {err}");
}

pub fn log_endpoint_failed(port_index: usize, fd_index: usize, err: &io::Error) {
    error!(port_index, fd_index, "listening socket failed, accept loop stopped: {err}");
}

pub fn log_dispatcher_gone(port_index: usize, fd_index: usize) {
    warn!(port_index, fd_index, "connection handler is gone, closing listening socket");
}

pub fn log_endpoint_closed(port_index: usize, fd_index: usize, addr: &SocketAddr) {
    debug!(port_index, fd_index, %addr, "listening socket closed");
}

pub fn log_shutdown_starting(observers: usize) {
    debug!(observers, "tcp server shutting down");
}

pub fn log_shutdown_complete() {
    debug!("tcp server shutdown complete");
}
