//! Error types for the spawn engine.
//!
//! Setup failures (redirect files, pipes, handles) and pump failures are
//! surfaced here. A program that cannot be executed is *not* an error: it
//! is reported through [`Completion::NotStarted`](crate::process::Completion)
//! and exit code 127.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::process::{PipeRole, StreamRole};

/// Result alias used throughout the library.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the spawn engine.
#[derive(Debug, Error)]
pub enum Error {
    /// The argument vector was empty.
    #[error("empty command: argument vector has no program")]
    EmptyCommand,

    /// A redirect file could not be opened.
    #[error("open failed: {}: {source}", path.display())]
    Open {
        /// Path that was being opened.
        path: PathBuf,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// An OS pipe could not be created.
    #[error("pipe failed: {0}")]
    Pipe(#[source] io::Error),

    /// A shared pipe end was already closed when a binding needed it.
    #[error("{role} end of pipe is already closed")]
    PipeEndClosed {
        /// The end that was requested.
        role: PipeRole,
    },

    /// A caller-supplied or shared handle could not be duplicated.
    #[error("invalid handle for {stream}: {source}")]
    Handle {
        /// Stream the handle was meant for.
        stream: StreamRole,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// A target points the wrong way for the stream it is bound to.
    #[error("{stream} cannot be bound to {target}")]
    Direction {
        /// Stream being bound.
        stream: StreamRole,
        /// Short description of the offending target.
        target: String,
    },

    /// Reading or writing a child stream failed.
    #[error("{stream} pump failed: {source}")]
    Pump {
        /// Stream whose I/O failed.
        stream: StreamRole,
        /// Underlying OS error.
        #[source]
        source: io::Error,
    },

    /// Waiting for the child failed.
    #[error("wait failed: {0}")]
    Wait(#[source] io::Error),

    /// The single-threaded pump runtime could not be built.
    #[error("pump runtime failed: {0}")]
    Runtime(#[source] io::Error),

    /// Invalid configuration value.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Whether this error happened before any child was created.
    pub const fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::EmptyCommand
                | Self::Open { .. }
                | Self::Pipe(_)
                | Self::PipeEndClosed { .. }
                | Self::Handle { .. }
                | Self::Direction { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_error_mentions_path() {
        let err = Error::Open {
            path: PathBuf::from("/no/such/dir/out.txt"),
            source: io::Error::from(io::ErrorKind::NotFound),
        };
        let msg = err.to_string();
        assert!(msg.starts_with("open failed: /no/such/dir/out.txt"));
        assert!(err.is_setup());
    }

    #[test]
    fn test_pump_error_is_not_setup() {
        let err = Error::Pump {
            stream: StreamRole::Stdout,
            source: io::Error::other("boom"),
        };
        assert_eq!(err.to_string(), "stdout pump failed: boom");
        assert!(!err.is_setup());
    }
}
