//! Waiting for a child and decoding how it ended.

use std::fmt;

use tracing::debug;

use super::spawner::{ProcessHandle, SpawnFailure};
use crate::error::{Error, Result};

/// Exit code reported when the child could not be created, executed, or its
/// status could not be decoded.
pub const EXIT_NOT_STARTED: i32 = 127;

/// Base added to a signal number to form an exit code.
pub const SIGNAL_EXIT_BASE: i32 = 128;

/// How a child terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    /// Normal termination with an exit code.
    Exited(i32),
    /// Killed by a signal.
    Signaled(i32),
}

impl ExitStatus {
    /// Decode a platform status. `None` when it is neither an exit nor a signal.
    pub fn from_std(status: std::process::ExitStatus) -> Option<Self> {
        if let Some(code) = status.code() {
            return Some(Self::Exited(code));
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Some(Self::Signaled(signal));
            }
        }
        None
    }

    /// `code` for a normal exit, `128 + signal` for a signal.
    pub const fn code(self) -> i32 {
        match self {
            Self::Exited(code) => code,
            Self::Signaled(signal) => SIGNAL_EXIT_BASE + signal,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with code {code}"),
            Self::Signaled(signal) => write!(f, "killed by signal {signal}"),
        }
    }
}

/// Final outcome of one attempted run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// The child ran and terminated.
    Terminated(ExitStatus),
    /// The child could not be created or executed.
    NotStarted(SpawnFailure),
    /// The child terminated but its status could not be decoded.
    Unresolved,
}

impl Completion {
    /// Single integer exit code.
    pub const fn code(&self) -> i32 {
        match self {
            Self::Terminated(status) => status.code(),
            Self::NotStarted(_) | Self::Unresolved => EXIT_NOT_STARTED,
        }
    }

    /// Whether the child exited with code 0.
    pub const fn success(&self) -> bool {
        matches!(self, Self::Terminated(ExitStatus::Exited(0)))
    }

    /// Decoded status, if the child ran.
    pub const fn status(&self) -> Option<ExitStatus> {
        match self {
            Self::Terminated(status) => Some(*status),
            Self::NotStarted(_) | Self::Unresolved => None,
        }
    }

    /// Why the child never ran, if it didn't.
    pub const fn spawn_failure(&self) -> Option<&SpawnFailure> {
        match self {
            Self::NotStarted(failure) => Some(failure),
            Self::Terminated(_) | Self::Unresolved => None,
        }
    }
}

impl fmt::Display for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Terminated(status) => status.fmt(f),
            Self::NotStarted(failure) => failure.fmt(f),
            Self::Unresolved => f.write_str("terminated with an undecodable status"),
        }
    }
}

/// Blocks until a child terminates.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessWaiter;

impl ProcessWaiter {
    /// Wait for `handle` exactly once.
    ///
    /// An invalid handle resolves to [`Completion::NotStarted`] immediately.
    /// Interrupted waits are retried until the OS reports termination.
    pub fn wait(handle: ProcessHandle) -> Result<Completion> {
        match handle {
            ProcessHandle::Invalid(failure) => Ok(Completion::NotStarted(failure)),
            ProcessHandle::Live(mut child) => {
                let pid = child.id();
                let status = child.wait().map_err(Error::Wait)?;
                let completion = ExitStatus::from_std(status)
                    .map_or(Completion::Unresolved, Completion::Terminated);
                debug!(pid, code = completion.code(), "child terminated");
                Ok(completion)
            }
        }
    }
}
