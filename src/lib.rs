//! Listening and accepting core of an RPC transport.
//!
//! A [`TcpServer`] binds one or more local addresses, accepts inbound
//! connections on every underlying socket concurrently and hands each one to a
//! registered [`ConnectHandler`] through the [`PollingEngine`]'s deferred
//! execution, together with an [`Acceptor`] that identifies the listener and
//! socket it came from.
//!
//! ```no_run
//! use tcp_acceptor::{Acceptor, Connection, PollingEngine, ServerConfig, TcpServer};
//!
//! # async fn run() -> tcp_acceptor::Result<()> {
//! let server = TcpServer::create(ServerConfig::default());
//! let port = server.add_port("0.0.0.0:0".parse().unwrap())?;
//! server.start(&PollingEngine::current()?, |conn: Connection, acceptor: Acceptor| {
//!     println!("{} via ({}, {})", conn.peer_addr(), acceptor.port_index(), acceptor.fd_index());
//! })?;
//! # let _ = port;
//! server.unref();
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod logger;
pub mod poller;
pub mod server;

pub use config::ServerConfig;
pub use error::{BindStage, Error, Result};
pub use poller::PollingEngine;
pub use server::{
    Acceptor, BindRequest, ConnectHandler, Connection, ShutdownObserver, TcpServer, WeakServer,
};
