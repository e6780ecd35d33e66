// Configuration types module
// Defines the server creation options and the daemon's file/env configuration

use serde::Deserialize;

/// Options recognised when a `TcpServer` is created.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ServerConfig {
    /// Expand a wildcard bind into a sibling socket of the other address family
    pub expand_wildcard_addrs: bool,
    /// `SO_REUSEPORT`, needed to bind a port another listener already holds
    pub reuse_port: bool,
    /// `SO_REUSEADDR`
    pub reuse_address: bool,
    /// Listen backlog for every socket
    pub backlog: i32,
    /// `TCP_NODELAY` on accepted connections
    pub tcp_nodelay: bool,
    /// Port-0 requests reuse the first listener's port when one exists
    pub share_wildcard_port: bool,
    /// Pause after EMFILE/ENFILE-style accept failures, in milliseconds
    pub accept_backoff_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            expand_wildcard_addrs: false,
            reuse_port: true,
            reuse_address: true,
            backlog: 1024,
            tcp_nodelay: true,
            share_wildcard_port: false,
            accept_backoff_ms: 100,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub const fn with_expand_wildcard_addrs(mut self, expand: bool) -> Self {
        self.expand_wildcard_addrs = expand;
        self
    }
}

/// Logging configuration
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log file path (optional, stdout if not set)
    #[serde(default)]
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

#[allow(clippy::missing_const_for_fn)]
fn default_log_level() -> String {
    "info".to_string()
}

/// Runtime configuration
#[derive(Debug, Deserialize, Clone, Default, PartialEq, Eq)]
pub struct RuntimeConfig {
    /// Worker threads driving the polling engine (CPU cores if unset)
    #[serde(default)]
    pub workers: Option<usize>,
}

/// Main configuration structure for the daemon
#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    /// Addresses to listen on, e.g. `"[::]:0"` or `"127.0.0.1:7000"`
    #[serde(default = "default_listen")]
    pub listen: Vec<String>,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

#[allow(clippy::missing_const_for_fn)]
fn default_listen() -> Vec<String> {
    vec!["[::]:0".to_string()]
}
