//! Supervision of the server under test
//!
//! A [`ProcessSupervisor`] spawns the server binary with piped output, drains
//! stdout and stderr on background threads, gates `start` on port readiness
//! and stops the child with SIGTERM escalating to SIGKILL.

pub mod config;
pub mod output;
pub mod supervisor;

pub use config::{ServerArgs, ServerConfig, ServerConfigBuilder, Timeouts};
pub use output::{DrainTask, OutputBuffer, OutputStream};
pub use supervisor::{
    CompletedRun, ExitReport, ProcessState, ProcessSupervisor, ServerProcessHandle, Termination,
};

use std::io;
use std::process::ExitStatus;
use std::time::Duration;

/// Result type for supervisor operations
pub type Result<T> = std::result::Result<T, Error>;

/// Supervisor errors
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to spawn {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("{command} exited during startup ({status})\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    ImmediateExit {
        command: String,
        status: ExitStatus,
        stdout: String,
        stderr: String,
    },

    #[error("Port {port} not reachable after {waited:?}: {reason}\nstdout:\n{stdout}\nstderr:\n{stderr}")]
    PortBindTimeout {
        port: u16,
        waited: Duration,
        reason: String,
        stdout: String,
        stderr: String,
    },

    #[error("Process {pid} ignored SIGTERM for {graceful_timeout:?} and was killed")]
    ShutdownTimeout {
        pid: u32,
        graceful_timeout: Duration,
        status: Option<ExitStatus>,
    },

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to drain {stream}: {source}")]
    Drain {
        stream: OutputStream,
        #[source]
        source: io::Error,
    },

    #[error("Drain thread for {0} panicked")]
    DrainPanicked(OutputStream),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Network error: {0}")]
    Network(#[from] crate::net::Error),
}

impl Error {
    /// Captured stdout attached to a startup failure
    pub fn stdout(&self) -> Option<&str> {
        match self {
            Error::ImmediateExit { stdout, .. } | Error::PortBindTimeout { stdout, .. } => {
                Some(stdout)
            }
            _ => None,
        }
    }

    /// Captured stderr attached to a startup failure
    pub fn stderr(&self) -> Option<&str> {
        match self {
            Error::ImmediateExit { stderr, .. } | Error::PortBindTimeout { stderr, .. } => {
                Some(stderr)
            }
            _ => None,
        }
    }
}
