//! Polling engine backed by the tokio runtime.
//!
//! The acceptor only needs three things from its engine: register a
//! descriptor for read readiness, take it back out, and run work later on
//! some worker thread. `AsyncFd` gives the first two, `Handle::spawn` the last.

use std::fmt;
use std::future::Future;

use socket2::Socket;
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;
use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use crate::error::{Error, Result};

/// Readiness notification and deferred-execution source for a `TcpServer`.
#[derive(Clone)]
pub struct PollingEngine {
    handle: Handle,
}

impl PollingEngine {
    /// Engine for the runtime the caller is running on.
    pub fn current() -> Result<Self> {
        Handle::try_current()
            .map(Self::from_handle)
            .map_err(|_| Error::NoRuntime)
    }

    pub const fn from_handle(handle: Handle) -> Self {
        Self { handle }
    }

    pub const fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Register a listening socket for read readiness.
    ///
    /// On failure the socket is handed back untouched so the caller can keep
    /// ownership of the descriptor.
    #[allow(unsafe_code)]
    pub(crate) fn register(
        &self,
        socket: Socket,
    ) -> std::result::Result<AsyncFd<Socket>, (Socket, std::io::Error)> {
        let _guard = self.handle.enter();
        // SAFETY: `Socket` owns its descriptor and always reports the same one.
        // It stays open until `deregister` hands it back or the `AsyncFd` drops.
        unsafe { AsyncFd::register_with_interest(socket, Interest::READABLE) }
            .map_err(|e| e.into_parts())
    }

    /// Remove a socket from the reactor and return it.
    pub(crate) fn deregister(registration: AsyncFd<Socket>) -> Socket {
        registration.into_inner()
    }

    /// Run `task` later on one of the engine's workers.
    pub fn run<F>(&self, task: F) -> JoinHandle<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.handle.spawn(task)
    }
}

impl fmt::Debug for PollingEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PollingEngine")
            .field("runtime", &self.handle.runtime_flavor())
            .finish()
    }
}
