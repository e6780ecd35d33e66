// Error types
// Binding, registration and endpoint failures plus lifecycle misuse

use std::fmt;
use std::io;
use std::net::SocketAddr;

/// Step of the socket setup that failed while binding a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindStage {
    Create,
    SetOption,
    Bind,
    Listen,
    LocalAddr,
}

impl fmt::Display for BindStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::SetOption => write!(f, "configure"),
            Self::Bind => write!(f, "bind"),
            Self::Listen => write!(f, "listen on"),
            Self::LocalAddr => write!(f, "read local address of"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("failed to {stage} socket for {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        stage: BindStage,
        #[source]
        source: io::Error,
    },

    #[error("failed to register {addr} with the polling engine: {source}")]
    Register {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("listening socket ({port_index}, {fd_index}) failed: {source}")]
    Endpoint {
        port_index: usize,
        fd_index: usize,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server listeners are shut down")]
    ShutDown,

    #[error("no tokio runtime available to drive the polling engine")]
    NoRuntime,

    #[error("invalid address '{0}'")]
    InvalidAddress(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),
}

impl Error {
    /// OS error code carried by socket-level failures.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Bind { source, .. }
            | Self::Register { source, .. }
            | Self::Endpoint { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// True when the host has no support for the address family at all,
    /// as opposed to the address or port being unusable.
    pub(crate) fn is_family_unavailable(&self) -> bool {
        matches!(self, Self::Bind { stage, .. } if *stage != BindStage::Listen)
            && matches!(
                self.raw_os_error(),
                Some(libc::EAFNOSUPPORT | libc::EADDRNOTAVAIL | libc::EPROTONOSUPPORT)
            )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
