// Shutdown module
// Shutdown observers, the caller-owned weak slot, the stop signal shared with
// accept loops and the one-shot shutdown-complete notifier

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tokio::sync::Notify;

use super::{lock, ServerInner, TcpServer};
use crate::logger;

/// Callback fired exactly once when its server begins shutting down.
///
/// Registration does not keep the server alive.
pub struct ShutdownObserver {
    callback: Box<dyn FnOnce() + Send>,
}

impl ShutdownObserver {
    pub fn new(callback: impl FnOnce() + Send + 'static) -> Self {
        Self {
            callback: Box::new(callback),
        }
    }

    pub(crate) fn notify(self) {
        (self.callback)();
    }
}

impl fmt::Debug for ShutdownObserver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("ShutdownObserver")
    }
}

/// Non-owning slot that empties itself when the server starts shutting down.
///
/// Set it while holding a strong reference; once the last reference is
/// released the slot reads as unset, and only after its observer has run.
#[derive(Clone, Default)]
pub struct WeakServer {
    slot: Arc<Mutex<Option<Weak<ServerInner>>>>,
}

impl WeakServer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, server: &TcpServer) {
        *lock(&self.slot) = Some(Arc::downgrade(&server.inner));
        let slot = Arc::clone(&self.slot);
        server.shutdown_starting_add(ShutdownObserver::new(move || {
            lock(&slot).take();
        }));
    }

    pub fn is_set(&self) -> bool {
        lock(&self.slot).is_some()
    }

    /// Strong reference, if the server has not begun shutting down.
    pub fn upgrade(&self) -> Option<TcpServer> {
        lock(&self.slot)
            .as_ref()
            .and_then(Weak::upgrade)
            .map(|inner| TcpServer { inner })
    }
}

impl fmt::Debug for WeakServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakServer")
            .field("set", &self.is_set())
            .finish()
    }
}

/// Stop request observed by every accept loop of one server.
#[derive(Debug, Default)]
pub(crate) struct ShutdownSignal {
    requested: AtomicBool,
    notify: Notify,
}

impl ShutdownSignal {
    pub(crate) fn trigger(&self) {
        self.requested.store(true, Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    pub(crate) fn is_triggered(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    /// Resolves once `trigger` has been called, including before this call.
    pub(crate) async fn wait(&self) {
        let notified = self.notify.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.is_triggered() {
            return;
        }
        notified.await;
    }
}

/// Fires its callback when the last holder lets go.
///
/// The server, every accept loop and the dispatcher each hold one.
pub(crate) struct ShutdownComplete {
    callback: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ShutdownComplete {
    pub(crate) fn new(callback: Option<Box<dyn FnOnce() + Send>>) -> Arc<Self> {
        Arc::new(Self {
            callback: Mutex::new(callback),
        })
    }
}

impl Drop for ShutdownComplete {
    fn drop(&mut self) {
        logger::log_shutdown_complete();
        let callback = self
            .callback
            .get_mut()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(callback) = callback {
            callback();
        }
    }
}
