// Configuration module entry point
// Server creation options and daemon configuration loading

mod types;

use std::net::SocketAddr;

use crate::error::{Error, Result};

// Re-export public types
pub use types::{AppConfig, LoggingConfig, RuntimeConfig, ServerConfig};

impl AppConfig {
    /// Load configuration from specified file path (without extension)
    /// layered with `ACCEPTOR_`-prefixed environment variables.
    /// A missing file is not an error; defaults apply.
    pub fn load_from(config_path: &str) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name(config_path).required(false))
            .add_source(
                config::Environment::with_prefix("ACCEPTOR")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_default("logging.level", "info")?
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Parse every `listen` entry, failing on the first malformed one.
    pub fn listen_addrs(&self) -> Result<Vec<SocketAddr>> {
        self.listen
            .iter()
            .map(|addr| {
                addr.parse()
                    .map_err(|e| Error::InvalidAddress(format!("{addr}: {e}")))
            })
            .collect()
    }
}
