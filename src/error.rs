//! Errors that can stop a gateway launch from making progress.
//!
//! Only these conditions ever reach the UI, and they reach it as a `failed`
//! state carrying the rendered message, never as a raw error.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A launch attempt that could not move forward.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// Every candidate port in the search space was taken.
    #[error("no free port found in {span} candidates starting at {preferred}")]
    NoPortAvailable { preferred: u16, span: u16 },
    /// The runtime binary is missing or not executable.
    #[error("failed to spawn gateway runtime {}: {source}", .program.display())]
    Spawn {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    /// The child never accepted a TCP connection.
    #[error("Gateway did not open the port within {}s.", .after.as_secs())]
    ReadinessTimeout { after: Duration },
    /// A gateway child is still live; stop it before launching another.
    #[error("a gateway process is already running (pid {pid})")]
    AlreadyRunning { pid: u32 },
    /// Preparing directories or log files failed.
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },
}

impl LaunchError {
    pub(crate) fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}
