//! Log writer module
//!
//! Resolves the configured log target (stdout or an append-mode file) into a
//! writer the subscriber can share between threads.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;
use std::sync::Mutex;

use tracing_subscriber::fmt::writer::BoxMakeWriter;

/// Log output target
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogTarget {
    /// Write to stdout
    Stdout,
    /// Append to file
    File(String),
}

impl LogTarget {
    pub fn from_path(path: Option<&str>) -> Self {
        path.map_or(Self::Stdout, |p| Self::File(p.to_string()))
    }

    /// Whether terminal colour codes make sense for this target
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Stdout)
    }

    /// Build the writer for this target, opening the file if needed
    pub fn make_writer(&self) -> io::Result<BoxMakeWriter> {
        match self {
            Self::Stdout => Ok(BoxMakeWriter::new(io::stdout)),
            Self::File(path) => {
                let file = open_log_file(path)?;
                Ok(BoxMakeWriter::new(Mutex::new(file)))
            }
        }
    }
}

/// Open or create a log file for appending
fn open_log_file(path: &str) -> io::Result<File> {
    // Create parent directories if they don't exist
    if let Some(parent) = Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    OpenOptions::new().create(true).append(true).open(path)
}
